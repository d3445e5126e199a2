//! Small text helpers shared across the pipeline.

/// Truncate to at most `max` characters, appending `...` when shortened.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Collapse a possibly multi-line string onto a single trimmed line.
pub fn single_line(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_truncate_no_change() {
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn test_single_line() {
        assert_eq!(single_line("  a\r\nb\nc  "), "a b c");
    }
}
