//! Detection of the Download Manager's listening socket via the kernel's
//! TCP table.

/// Socket state `LISTEN` in `/proc/net/tcp`.
const LISTEN_STATE: &str = "0A";
const ADDRESS_INDEX: usize = 1;
const STATUS_INDEX: usize = 3;
const UID_INDEX: usize = 7;

/// Scans `/proc/net/tcp` content for a listening socket on `port` owned by
/// `uid`. The local address field is `hexip:hexport`.
pub fn has_listener(proc_net_tcp: &str, uid: u32, port: u16) -> bool {
    let uid = uid.to_string();
    for line in proc_net_tcp.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() <= UID_INDEX {
            continue;
        }
        if fields[UID_INDEX] != uid || fields[STATUS_INDEX] != LISTEN_STATE {
            continue;
        }
        let hex_port = match fields[ADDRESS_INDEX].rsplit(':').next() {
            Some(hex_port) => hex_port,
            None => continue,
        };
        if u32::from_str_radix(hex_port, 16) == Ok(u32::from(port)) {
            return true;
        }
    }
    false
}
