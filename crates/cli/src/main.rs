mod command;
mod render;

use std::process::ExitCode;

use phoenix_chat::{
    ChatBoundary, ChatError, ControllerConfig, ConversationController, SettingsError,
    SettingsStore, SubmitOutcome,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

use command::{Command, HELP, is_affirmative};

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to start chat on `{stage}`: {source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "phoenix stopped");
            eprintln!("error: {}", snafu::Report::from_error(error));
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CliResult<()> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    // Missing credentials are fatal before anything touches disk or network.
    let session = settings.model_session().context(ChatSnafu {
        stage: "create-model-session",
    })?;
    let store = settings.open_history_store().await.context(ChatSnafu {
        stage: "open-history-store",
    })?;

    let controller = ConversationController::new(
        store,
        session,
        ControllerConfig::with_response_delay(settings.response_delay()),
    );
    controller.initialize().await;
    let boundary = ChatBoundary::new(controller.clone());

    let mut stdout = tokio::io::stdout();
    let history = render::history_transcript(&boundary.snapshot());
    write_out(&mut stdout, &format!("{history}{HELP}\n")).await?;

    let renderer = tokio::spawn(render::follow(boundary.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = next_line(&mut lines).await? {
        match Command::parse(&line) {
            Command::Blank => {}
            Command::Send(text) => match boundary.submit(&text) {
                SubmitOutcome::Started(task) => {
                    task.wait().await;
                    if let Some(error) = controller.last_persistence_error() {
                        write_out(
                            &mut stdout,
                            &format!("(reply not saved to history: {error})\n"),
                        )
                        .await?;
                    }
                }
                SubmitOutcome::Rejected => {
                    write_out(&mut stdout, "(still waiting for the previous reply)\n").await?;
                }
                SubmitOutcome::Ignored => {}
            },
            Command::Delete => {
                if !boundary.request_delete() {
                    write_out(&mut stdout, "(nothing to delete)\n").await?;
                    continue;
                }

                write_out(&mut stdout, "Delete the whole conversation? [y/N] ").await?;
                let answer = next_line(&mut lines).await?.unwrap_or_default();
                if is_affirmative(&answer) {
                    match boundary.confirm_delete().await {
                        Ok(()) => write_out(&mut stdout, "(history deleted)\n").await?,
                        Err(error) => {
                            tracing::warn!(error = %error, "failed to delete history");
                            write_out(&mut stdout, &format!("(delete failed: {error})\n"))
                                .await?;
                        }
                    }
                } else {
                    boundary.cancel_delete();
                }
            }
            Command::Delay(delay) => {
                let mut updated = (*settings_store.settings()).clone();
                updated.response_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                settings_store.update(updated).context(SettingsSnafu {
                    stage: "update-response-delay",
                })?;
                controller.reconfigure(ControllerConfig::with_response_delay(delay));
                write_out(
                    &mut stdout,
                    &format!("(replies now start after {} ms)\n", delay.as_millis()),
                )
                .await?;
            }
            Command::Help => write_out(&mut stdout, &format!("{HELP}\n")).await?,
            Command::Invalid(reason) => write_out(&mut stdout, &format!("({reason})\n")).await?,
            Command::Quit => break,
        }
    }

    renderer.abort();
    Ok(())
}

async fn next_line(lines: &mut Lines<BufReader<Stdin>>) -> CliResult<Option<String>> {
    lines.next_line().await.context(TerminalSnafu {
        stage: "read-stdin",
    })
}

async fn write_out(stdout: &mut tokio::io::Stdout, text: &str) -> CliResult<()> {
    stdout
        .write_all(text.as_bytes())
        .await
        .context(TerminalSnafu {
            stage: "write-stdout",
        })?;
    stdout.flush().await.context(TerminalSnafu {
        stage: "flush-stdout",
    })
}
