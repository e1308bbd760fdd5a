//! Log retrieval — last-N lines with optional "since" cut-off.

use bollard::container::LogOutput;
use bollard::query_parameters::LogsOptions;
use futures_util::stream::StreamExt;

use super::client::{classify, DockerClient, DriverError};

impl DockerClient {
    /// Fetch up to `tail` log lines, optionally starting at `since`
    /// (epoch seconds).
    pub async fn tail_logs(
        &self,
        container_id: &str,
        tail: u32,
        since: Option<i64>,
    ) -> Result<Vec<String>, DriverError> {
        // Bollard takes i32 epoch seconds here; clamp rather than wrap.
        let since = since
            .unwrap_or(0)
            .clamp(0, i32::MAX as i64) as i32;

        let options = LogsOptions {
            follow: false,
            stdout: true,
            stderr: true,
            since,
            until: 0,
            timestamps: false,
            tail: tail.to_string(),
        };

        let mut stream = self.client.logs(container_id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let output = chunk.map_err(classify)?;
            lines.push(render_log_line(output));
        }
        Ok(lines)
    }
}

fn render_log_line(output: LogOutput) -> String {
    let raw = match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    };
    String::from_utf8_lossy(&raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_render_strips_trailing_newline() {
        let output = LogOutput::StdOut {
            message: Bytes::from("listening on 0.0.0.0:1337\n"),
        };
        assert_eq!(render_log_line(output), "listening on 0.0.0.0:1337");
    }

    #[test]
    fn test_render_handles_invalid_utf8() {
        let output = LogOutput::StdErr {
            message: Bytes::from(vec![0xFF, 0xFE, b'o', b'k']),
        };
        let line = render_log_line(output);
        assert!(line.ends_with("ok"));
    }

    #[test]
    fn test_render_keeps_interior_newlines() {
        let output = LogOutput::StdOut {
            message: Bytes::from("line one\nline two\n"),
        };
        assert_eq!(render_log_line(output), "line one\nline two");
    }
}
