//! Simulated axis controllers. Every command addressed to an axis is
//! acknowledged at once; motion commands report completion immediately.
pub mod pty;

use axis_protocol::{decode_line, FrameError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

pub const COMPLETION_REPLY: &str = "SEQUENCE COMPLETED";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockReport {
    pub lines: usize,
    pub commands: usize,
    pub rejected: usize,
}

/// The replies a bus full of well-behaved axes would send for `line`.
pub fn replies_for(line: &str) -> Result<Vec<String>, FrameError> {
    let commands = decode_line(line)?;
    Ok(commands
        .iter()
        .map(|command| {
            if command.code.is_motion() {
                format!("{};{}", command.target, COMPLETION_REPLY)
            } else {
                format!("{};OK", command.target)
            }
        })
        .collect())
}

/// Serves the bus until `input` closes.
pub async fn mock_axes<R, W>(input: R, mut output: W) -> anyhow::Result<MockReport>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut report = MockReport::default();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.lines += 1;
        let replies = match replies_for(line) {
            Ok(replies) => {
                debug!("{} -> {} replies", line, replies.len());
                report.commands += replies.len();
                replies
            }
            Err(e @ FrameError::ChecksumMismatch { .. }) => {
                warn!("dropping {:?}: {}", line, e);
                report.rejected += 1;
                vec!["ERR CRC".to_string()]
            }
            Err(e) => {
                warn!("dropping {:?}: {}", line, e);
                report.rejected += 1;
                vec![format!("ERR {}", e)]
            }
        };
        for mut reply in replies {
            reply.push('\n');
            output.write_all(reply.as_bytes()).await?;
        }
        output.flush().await?;
    }
    Ok(report)
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, split};

    use super::*;

    #[test]
    fn test_replies() {
        assert_eq!(replies_for("x;1;100").unwrap(), vec!["x;SEQUENCE COMPLETED"]);
        assert_eq!(replies_for("t;6;500").unwrap(), vec!["t;OK"]);
        assert_eq!(replies_for("#x;2,y;2,z;2,t;2,g;2*0D#").unwrap().len(), 5);
        assert_eq!(
            replies_for("#x;1;100,y;1;50*00#"),
            Err(FrameError::ChecksumMismatch { carried: 0x00, computed: 0xEA })
        );
        assert!(replies_for("q;1;5").is_err());
    }

    #[tokio::test]
    async fn test_serves_until_closed() {
        let (host, axes) = duplex(1024);
        let (axes_in, axes_out) = split(axes);
        let server = tokio::spawn(mock_axes(axes_in, axes_out));
        let (host_in, mut host_out) = split(host);
        host_out
            .write_all(b"#x;1;100,y;1;50*EA#\nx;6;10\n\n#x;1;1*FF#\n")
            .await
            .unwrap();
        let mut replies = BufReader::new(host_in).lines();
        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(replies.next_line().await.unwrap().unwrap());
        }
        assert_eq!(
            received,
            vec!["x;SEQUENCE COMPLETED", "y;SEQUENCE COMPLETED", "x;OK", "ERR CRC"]
        );
        drop(replies);
        drop(host_out);
        let report = server.await.unwrap().unwrap();
        assert_eq!(report, MockReport { lines: 3, commands: 3, rejected: 1 });
    }
}
