use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[snafu(context(suffix(false)))] // disables default `Snafu` suffix
pub enum Error {
    #[snafu(display("No EPSG code for SRS '{srs_string}'"))]
    NoEpsgCode { srs_string: String },

    #[snafu(display("Unsupported EPSG code {epsg}, only 4326 is supported"))]
    UnsupportedEpsgCode { epsg: u32 },

    #[snafu(display("Bounding box corners are not ordered: {reason}"))]
    UnsupportedBbox { reason: String },

    #[snafu(display("Cannot parse coordinate pair from '{input}'"))]
    CornerParse { input: String },

    #[snafu(display("Cannot parse timestamp '{input}'"))]
    TimestampParse { input: String },

    #[snafu(display("Cannot read land shapefile '{path}': {source}"))]
    ShapefileRead {
        path: String,
        source: shapefile::Error,
    },
}
