pub mod backoff;
pub mod cache;
pub mod coordinator;
pub mod detector;
pub mod fetch;
pub mod hasher;
pub mod paths;
pub mod resources;
pub mod transfer;
pub mod writer;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Parse an RFC 3339 node timestamp to unix seconds. `None` stays `None`.
pub(crate) fn parse_timestamp(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}
