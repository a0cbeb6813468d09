use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

/// Parse a `Name: Value` string into a header pair. Malformed input is
/// logged and skipped.
fn parse_header(header_str: &str) -> Option<(HeaderName, HeaderValue)> {
    let Some((name, value)) = header_str.split_once(':') else {
        warn!(header = %header_str, "Invalid header format, expected 'Name: Value'");
        return None;
    };

    let (name, value) = (name.trim(), value.trim());

    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        warn!(name = %name, "Invalid header name");
        return None;
    };

    let Ok(header_value) = HeaderValue::from_str(value) else {
        warn!(name = %name, "Invalid header value");
        return None;
    };

    debug!(name = %name, "Adding request header");
    Some((header_name, header_value))
}

/// Parse a collection of header strings into a HeaderMap
pub fn parse_headers(header_strings: &[String]) -> HeaderMap {
    header_strings
        .iter()
        .filter_map(|header_str| parse_header(header_str))
        .fold(HeaderMap::new(), |mut headers, (name, value)| {
            headers.insert(name, value);
            headers
        })
}
