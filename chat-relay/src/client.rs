use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, connection::LineReader, protocol::QUIT_COMMAND};

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.nickname.trim().is_empty() {
        bail!("nickname cannot be empty");
    }

    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    info!("connected to {}:{}", args.host, args.port);

    let (reader, mut writer) = stream.into_split();
    let mut server = LineReader::new(BufReader::new(reader));
    send_line(&mut writer, &args.nickname)
        .await
        .context("failed to send nickname")?;

    let mut stdin = LineReader::new(BufReader::new(tokio::io::stdin()));
    run_client_loop(&mut server, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn run_client_loop<S, I>(
    server: &mut LineReader<S>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut LineReader<I>,
) -> Result<()>
where
    S: AsyncBufRead + Unpin,
    I: AsyncBufRead + Unpin,
{
    loop {
        select! {
            server_line = server.read_line_lossy() => {
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            input = stdin.read_line_lossy() => {
                if !handle_stdin_input(input?, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    match line {
        Ok(Some(line)) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        Ok(None) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Err(error) => {
            warn!(?error, "failed to read from server");
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

/// Forwards one stdin line. End of input is treated as the quit command.
async fn handle_stdin_input<W>(input: Option<String>, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let text = match input {
        Some(line) => line.trim_end_matches('\r').to_string(),
        None => QUIT_COMMAND.to_string(),
    };

    if let Err(error) = send_line(writer, &text).await {
        warn!(?error, "failed to send line");
        write_stdout("*** connection to server lost").await?;
        return Ok(false);
    }

    Ok(text != QUIT_COMMAND)
}

async fn send_line<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, duplex};

    use super::*;

    #[tokio::test]
    async fn end_of_input_sends_quit() {
        let (mut writer, mut peer) = duplex(64);

        assert!(!handle_stdin_input(None, &mut writer).await.unwrap());
        drop(writer);

        let mut sent = String::new();
        peer.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "/quit\n");
    }

    #[tokio::test]
    async fn lines_are_forwarded_verbatim() {
        let (mut writer, mut peer) = duplex(64);

        assert!(handle_stdin_input(Some("  hi there\r".into()), &mut writer)
            .await
            .unwrap());
        assert!(handle_stdin_input(Some(String::new()), &mut writer)
            .await
            .unwrap());
        assert!(!handle_stdin_input(Some("/quit".into()), &mut writer)
            .await
            .unwrap());
        drop(writer);

        let mut sent = String::new();
        peer.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "  hi there\n\n/quit\n");
    }

    #[tokio::test]
    async fn server_lines_decode_lossily() {
        let (mut server, reader) = duplex(64);
        let mut reader = LineReader::new(BufReader::new(reader));

        server.write_all(b"bad \xff byte\n").await.unwrap();
        let line = reader.read_line_lossy().await.unwrap();
        assert_eq!(line.as_deref(), Some("bad \u{FFFD} byte"));
    }
}
