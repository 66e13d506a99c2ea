use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    task::JoinHandle,
    time::timeout,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    message::{is_quit, read_line, write_line},
};

/// How long to wait for the server to close its side after we stop sending.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    write_stdout("✅ Connected to the server").await?;
    write_line(&mut writer, &args.name)
        .await
        .context("failed to send display name")?;

    let mut relay = tokio::spawn(print_server_lines(reader));
    let mut stdin = BufReader::new(io::stdin());

    run_client_loop(&mut relay, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;
    wait_for_relay(relay).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("could not connect to server {}:{}", args.host, args.port))?;

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    relay: &mut JoinHandle<io::Result<()>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<io::Stdin>,
) -> Result<()> {
    loop {
        select! {
            _ = &mut *relay => break,
            input = read_line(stdin) => {
                if !handle_stdin_input(input?, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

/// Echoes server lines to stdout until the server goes away.
async fn print_server_lines(mut reader: BufReader<OwnedReadHalf>) -> io::Result<()> {
    loop {
        match read_line(&mut reader).await {
            Ok(Some(line)) => write_stdout(&line).await?,
            Ok(None) | Err(_) => return write_stdout("❌ Connection closed.").await,
        }
    }
}

async fn wait_for_relay(mut relay: JoinHandle<io::Result<()>>) {
    if relay.is_finished() {
        return;
    }
    match timeout(CLOSE_GRACE, &mut relay).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => warn!(?error, "failed to print server output"),
        Ok(Err(error)) => warn!(?error, "server reader task failed"),
        Err(_) => relay.abort(),
    }
}

async fn handle_stdin_input(input: Option<String>, writer: &mut OwnedWriteHalf) -> Result<bool> {
    let Some(text) = input else {
        return Ok(false);
    };

    // The server needs to see the quit command too, so it is sent before leaving.
    write_line(writer, &text)
        .await
        .context("failed to send line to server")?;
    Ok(!is_quit(&text))
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
