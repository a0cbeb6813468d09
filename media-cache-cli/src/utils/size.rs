use crate::error::AppError;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Parse a size with an optional unit (B, KB, MB, GB, TB), case-insensitive.
/// A bare number is taken as bytes.
pub fn parse_size(size_str: &str) -> Result<u64, AppError> {
    let size_str = size_str.trim().to_lowercase();

    if size_str.is_empty() {
        return Err(AppError::ParseError("Invalid size: empty string".to_string()));
    }

    let split = size_str
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size_str.len());
    let (numeric_part, unit_part) = size_str.split_at(split);

    if unit_part.is_empty() {
        return numeric_part
            .parse::<u64>()
            .map_err(|_| AppError::ParseError(format!("Invalid size: {size_str}")));
    }

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid size: {size_str}")))?;

    let multiplier = match unit_part.trim() {
        "b" => 1,
        "kb" | "k" => KB,
        "mb" | "m" => MB,
        "gb" | "g" => GB,
        "tb" | "t" => TB,
        unit => return Err(AppError::ParseError(format!("Invalid size unit: {unit}"))),
    };

    Ok((value * multiplier as f64) as u64)
}

/// Convert bytes to a human-readable format
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
