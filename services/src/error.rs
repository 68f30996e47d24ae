use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[snafu(context(suffix(false)))] // disables default `Snafu` suffix
pub enum Error {
    #[snafu(display("Configuration error: {message}"))]
    Config { message: String },

    #[snafu(display("Download Manager error: {message}"))]
    Dm { message: String },

    #[snafu(display("Ingestion error: {message}"))]
    Ingestion { message: String },

    /// Cooperative cancellation; a stop request was observed at a
    /// checkpoint. Handlers restore the scenario to `IDLE`.
    #[snafu(display("Stop request"))]
    Cancelled,

    #[snafu(display("Unknown scenario id {scenario_id}"))]
    UnknownScenario { scenario_id: i64 },

    DataType {
        source: eoingest_datatypes::Error,
    },

    Io {
        source: std::io::Error,
    },

    Reqwest {
        source: reqwest::Error,
    },

    SerdeJson {
        source: serde_json::Error,
    },

    Xml {
        source: roxmltree::Error,
    },

    ConfigFile {
        source: config::ConfigError,
    },

    Logger {
        source: flexi_logger::FlexiLoggerError,
    },
}

impl From<eoingest_datatypes::Error> for Error {
    fn from(source: eoingest_datatypes::Error) -> Self {
        Self::DataType { source }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        Self::Reqwest { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::SerdeJson { source }
    }
}

impl From<roxmltree::Error> for Error {
    fn from(source: roxmltree::Error) -> Self {
        Self::Xml { source }
    }
}

impl From<config::ConfigError> for Error {
    fn from(source: config::ConfigError) -> Self {
        Self::ConfigFile { source }
    }
}

impl From<flexi_logger::FlexiLoggerError> for Error {
    fn from(source: flexi_logger::FlexiLoggerError) -> Self {
        Self::Logger { source }
    }
}
