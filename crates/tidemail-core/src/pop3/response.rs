//! POP3 Response generation

/// POP3 Response builder
pub struct Pop3Response;

impl Pop3Response {
    /// Server greeting carrying the APOP timestamp
    pub fn greeting(server_name: &str, timestamp: &str) -> String {
        format!("+OK {} POP3 ready {}\r\n", server_name, timestamp)
    }

    pub fn ok(message: &str) -> String {
        format!("+OK {}\r\n", message)
    }

    pub fn err(message: &str) -> String {
        format!("-ERR {}\r\n", message)
    }

    pub fn stat(count: i64, size: i64) -> String {
        format!("+OK {} {}\r\n", count, size)
    }

    /// Multi-line response: status line, one line per entry, terminator
    pub fn multi_line<I, S>(status: &str, lines: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = format!("+OK {}\r\n", status);
        for line in lines {
            out.push_str(&Self::byte_stuff_line(line.as_ref()));
            out.push_str("\r\n");
        }
        out.push_str(".\r\n");
        out
    }

    /// RETR response: the message body dot-stuffed and terminated
    pub fn message(content: &str) -> String {
        let body = content.strip_suffix("\r\n").unwrap_or(content);
        Self::multi_line(&format!("{} octets", content.len()), body.split("\r\n"))
    }

    pub fn capabilities() -> String {
        Self::multi_line(
            "Capability list follows",
            ["USER", "UIDL", "IMPLEMENTATION Tidemail-POP3"],
        )
    }

    /// Byte-stuff a line (add leading dot if line starts with dot)
    pub fn byte_stuff_line(line: &str) -> String {
        if line.starts_with('.') {
            format!(".{}", line)
        } else {
            line.to_string()
        }
    }
}
