//! Small parsing helpers shared by the command layer.
//!
//! - **URL validation**: feed URLs must be absolute http(s) URLs
//! - **Durations**: `30s`, `1m`, `1h30m` style intervals for `agg`

mod duration;
mod url_validator;

pub use duration::{parse_duration, DurationParseError};
pub use url_validator::{validate_feed_url, UrlValidationError};
