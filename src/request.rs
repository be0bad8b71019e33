use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// One decoded client command.
#[derive(Debug, Clone)]
pub struct Request {
    /// Command name as sent by the client (case preserved).
    pub name: String,
    /// Raw arguments; `None` is a null bulk string or a padding slot.
    pub args: Vec<Option<Bytes>>,
    /// Peer identifier of the originating connection.
    pub host: String,
    /// Fires when the originating connection is torn down.
    pub teardown: CancellationToken,
}

impl Request {
    pub fn new(name: impl Into<String>, args: Vec<Option<Bytes>>) -> Self {
        Self {
            name: name.into(),
            args,
            host: String::new(),
            teardown: CancellationToken::new(),
        }
    }

    /// Attach the connection this request arrived on.
    pub fn from_connection(mut self, host: &str, teardown: &CancellationToken) -> Self {
        self.host = host.to_string();
        self.teardown = teardown.clone();
        self
    }

    /// Render the request the way the audit log prints it:
    /// `host "name" "arg1" "arg2"`.
    pub fn monitor_line(&self) -> String {
        self.padded_monitor_line(0)
    }

    /// Like [`monitor_line`](Self::monitor_line), with missing arguments up
    /// to `slots` printed as `""`.
    pub fn padded_monitor_line(&self, slots: usize) -> String {
        let mut line = format!("{} \"{}\"", self.host, self.name);
        let missing = slots.saturating_sub(self.args.len());
        let args = self
            .args
            .iter()
            .map(|arg| arg.as_deref().unwrap_or_default())
            .chain(std::iter::repeat(&b""[..]).take(missing));
        for arg in args {
            line.push_str(" \"");
            line.push_str(&String::from_utf8_lossy(arg));
            line.push('"');
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_line() {
        let teardown = CancellationToken::new();
        let request = Request::new(
            "SET",
            vec![Some(Bytes::from_static(b"k")), Some(Bytes::from_static(b"v 1"))],
        )
        .from_connection("127.0.0.1:5000", &teardown);
        assert_eq!(request.monitor_line(), r#"127.0.0.1:5000 "SET" "k" "v 1""#);

        let bare = Request::new("PING", vec![]).from_connection("peer", &teardown);
        assert_eq!(bare.monitor_line(), r#"peer "PING""#);

        let padded = Request::new("GET", vec![None]).from_connection("peer", &teardown);
        assert_eq!(padded.monitor_line(), r#"peer "GET" """#);
    }

    #[test]
    fn test_padded_monitor_line_shows_missing_arguments() {
        let teardown = CancellationToken::new();
        let request = Request::new("SET", vec![Some(Bytes::from_static(b"k"))])
            .from_connection("peer", &teardown);

        assert_eq!(request.padded_monitor_line(3), r#"peer "SET" "k" "" """#);
        // Never truncates what the client sent.
        assert_eq!(request.padded_monitor_line(0), r#"peer "SET" "k""#);
        assert_eq!(request.padded_monitor_line(1), request.monitor_line());
    }
}
