//! Inspection of the first bytes of a forwarded connection

/// Largest header block inspected for a content type
const MAX_HEADER_SCAN: usize = 8192;

/// Whether `chunk` starts an HTTP response whose content type is HTML
pub fn is_html_response(chunk: &[u8]) -> bool {
    let scan = &chunk[..chunk.len().min(MAX_HEADER_SCAN)];
    if !scan.starts_with(b"HTTP/") {
        return false;
    }

    let header_end = find(scan, b"\r\n\r\n").unwrap_or(scan.len());
    let Ok(headers) = std::str::from_utf8(&scan[..header_end]) else {
        return false;
    };

    headers.split("\r\n").skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("content-type")
                && value.trim().to_ascii_lowercase().starts_with("text/html")
        })
    })
}

/// Response sent in place of a blocked HTML page
pub fn forbidden_response(message: &str) -> String {
    format!(
        "HTTP/1.1 403 Forbidden\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        message.len(),
        message
    )
}

/// First line of a client's request, if it is printable text
pub fn request_line(chunk: &[u8]) -> Option<&str> {
    let end = find(chunk, b"\r\n").unwrap_or(chunk.len());
    let line = std::str::from_utf8(&chunk[..end]).ok()?;
    if line.is_empty() || line.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(line)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_html() {
        let response = b"HTTP/1.1 200 OK\r\nServer: nginx\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<html>";
        assert!(is_html_response(response));

        let lowercase = b"HTTP/1.0 200 OK\r\ncontent-type:TEXT/HTML\r\n\r\n";
        assert!(is_html_response(lowercase));
    }

    #[test]
    fn test_ignores_other_content() {
        assert!(!is_html_response(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"html\":true}"
        ));
        // Body mentioning the header does not count
        assert!(!is_html_response(
            b"HTTP/1.1 200 OK\r\nContent-Length: 24\r\n\r\nContent-Type: text/html"
        ));
        assert!(!is_html_response(b"SSH-2.0-OpenSSH_9.6\r\n"));
        assert!(!is_html_response(b""));
    }

    #[test]
    fn test_forbidden_response_is_well_formed() {
        let response = forbidden_response("no web pages");
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(response.contains("Content-Length: 12\r\n"));
        assert!(response.ends_with("\r\n\r\nno web pages"));
    }

    #[test]
    fn test_request_line() {
        assert_eq!(
            request_line(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n"),
            Some("GET /index.html HTTP/1.1")
        );
        assert_eq!(request_line(b"\x16\x03\x01\x02\x00"), None);
    }
}
