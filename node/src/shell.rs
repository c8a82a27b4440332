use anyhow::Result;
use filemesh_session::CommandInterpreter;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reads stdin on a dedicated thread and forwards lines. The channel closes
/// on EOF or a read error.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                    if tx.blocking_send(trimmed).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Prompt/read/execute loop. Returns on `exit`, end of input or shutdown.
pub async fn run_shell<W>(
    interpreter: &mut CommandInterpreter,
    mut input: mpsc::Receiver<String>,
    output: &mut W,
    shutdown: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        output.write_all(interpreter.prompt().as_bytes()).await?;
        output.flush().await?;

        let line = tokio::select! {
            _ = shutdown.cancelled() => {
                output.write_all(b"\n").await?;
                break;
            }
            line = input.recv() => line,
        };
        let Some(line) = line else {
            output.write_all(b"\n").await?;
            break;
        };

        if line.trim() == "exit" {
            output.write_all(b"bye\n").await?;
            break;
        }

        let rendered = interpreter.interpret(&line).await;
        if !rendered.is_empty() {
            output.write_all(rendered.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
    }
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filemesh_registry::{NodeDirectory, NodeMap};
    use filemesh_session::{SessionConfig, SessionManager};

    fn interpreter() -> CommandInterpreter {
        let nodes = NodeMap::shared();
        nodes.upsert("n1", "127.0.0.1:9000");
        CommandInterpreter::new(SessionManager::new(nodes, SessionConfig::default()))
    }

    async fn feed(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.send(line.to_string()).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn exit_says_bye() {
        let mut shell = interpreter();
        let mut out = Vec::new();
        let input = feed(&["show", "", "bogus", "exit", "show"]).await;
        run_shell(&mut shell, input, &mut out, &CancellationToken::new())
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "root> n1: 127.0.0.1:9000\nroot> root> Error: unknown command: bogus\nroot> bye\n"
        );
    }

    #[tokio::test]
    async fn end_of_input_stops_the_loop() {
        let mut shell = interpreter();
        let mut out = Vec::new();
        let input = feed(&["cd n1"]).await;
        run_shell(&mut shell, input, &mut out, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "root> root/n1> \n");
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_waiting_prompt() {
        let mut shell = interpreter();
        let mut out = Vec::new();
        let (_tx, input) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        run_shell(&mut shell, input, &mut out, &shutdown).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "root> \n");
    }
}
