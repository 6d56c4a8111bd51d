use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::Instrument;

use super::{Connection, Outbound, Shared};
use crate::error::{Error, Result};

/// Spawns `command` and speaks newline-delimited JSON-RPC over its pipes.
///
/// The process is killed when the connection is shut down or dropped. Its
/// stderr is forwarded to the log.
pub(crate) fn connect_stdio(
    name: &str,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<Connection> {
    info!("starting MCP server `{name}`: {command} {}", args.join(" "));
    let mut child = Command::new(command)
        .args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::Spawn {
            command: command.to_owned(),
            source,
        })?;

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(Error::Protocol("server pipes are unavailable".to_owned()));
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let shared = Shared::new(outbound_tx);
    let span = debug_span!("mcp stdio", server = name);

    let reader = tokio::spawn(
        {
            let shared = Arc::clone(&shared);
            async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                trace!("received: {line}");
                                shared.dispatch(line);
                            }
                        }
                        Ok(None) => {
                            debug!("server closed its stdout");
                            break;
                        }
                        Err(err) => {
                            warn!("failed to read from server: {err}");
                            break;
                        }
                    }
                }
                shared.close();
            }
        }
        .instrument(span.clone()),
    );

    let writer = tokio::spawn(
        write_lines(stdin, outbound_rx, Arc::clone(&shared)).instrument(span.clone()),
    );

    let logger = tokio::spawn(
        async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("stderr: {line}");
            }
        }
        .instrument(span),
    );

    Ok(Connection::new(shared, vec![reader, writer, logger], Some(child)))
}

async fn write_lines(
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    while let Some(message) = outbound.recv().await {
        let mut line = message.body.into_bytes();
        line.push(b'\n');
        let written = match stdin.write_all(&line).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!("failed to write to server: {err}");
            shared.close();
            break;
        }
    }
}
