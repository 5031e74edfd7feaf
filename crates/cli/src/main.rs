mod command;
mod render;

use std::io::Write as _;
use std::sync::Arc;

use parley_session::{
    FileHandle, RenderModel, SessionClient, SessionController, SessionError, SessionStore,
    SettingsStore, SubmitOutcome, SubmitRejection, parse_user_id,
};
use parley_storage::{SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use command::{HELP, Intent};
use render::StreamPrinter;

const DEFAULT_USER: &str = "default";

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to open conversation database at {path}: {source}"))]
    OpenDatabase { path: String, source: StorageError },
    #[snafu(display("failed to start session: {source}"))]
    StartSession { source: SessionError },
    #[snafu(display("failed to read terminal input: {source}"))]
    ReadInput { source: std::io::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let raw_user = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| DEFAULT_USER.to_string());
    let user_id = parse_user_id(&raw_user).context(StartSessionSnafu)?;

    let settings_store = SettingsStore::load();
    match settings_store.ensure_settings_file() {
        Ok(true) => tracing::info!(
            path = ?settings_store.config_path(),
            "wrote default settings; add an API key there or set OPENAI_API_KEY"
        ),
        Ok(false) => {}
        Err(error) => tracing::warn!(error = %error, "could not write default settings"),
    }
    let settings = settings_store.settings();
    let database_path = settings.database_path(&settings_store.config_dir());
    let database = database_path.display().to_string();
    let backend = SqliteStorage::open(&database)
        .await
        .context(OpenDatabaseSnafu { path: database.clone() })?;
    let store = Arc::new(SessionStore::new(Arc::new(backend)));

    let provider = match settings.connect_provider() {
        Ok(provider) => Some(provider),
        Err(error) => {
            tracing::error!(error = %error, "inference provider not available");
            None
        }
    };

    let controller = SessionController::new(settings.controller_config(), store, provider);
    let client = SessionClient::start(controller, user_id)
        .await
        .context(StartSessionSnafu)?;

    let printer = tokio::spawn(print_updates(client.subscribe()));
    let result = read_loop(&client).await;

    client.shutdown().await;
    if let Err(error) = printer.await {
        tracing::warn!(error = %error, "render task failed");
    }
    result
}

async fn read_loop(client: &SessionClient) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context(ReadInputSnafu)? {
        let intent = match command::parse(&line) {
            Ok(intent) => intent,
            Err(error) => {
                eprintln!("{error}");
                continue;
            }
        };

        if intent == Intent::Quit {
            break;
        }
        if let Err(error) = dispatch(client, intent).await {
            eprintln!("{error}");
        }
    }
    Ok(())
}

async fn dispatch(client: &SessionClient, intent: Intent) -> Result<(), SessionError> {
    match intent {
        Intent::Submit(text) => match client.submit_turn(text).await? {
            SubmitOutcome::Submitted { .. } | SubmitOutcome::Ignored(SubmitRejection::Empty) => {}
            SubmitOutcome::Ignored(SubmitRejection::Busy) => {
                eprintln!("still answering; /cancel to stop it");
            }
            SubmitOutcome::Ignored(SubmitRejection::NotReady) => {
                eprintln!("session is not ready");
            }
        },
        Intent::Attach(path) => {
            let file = FileHandle::from_path(&path)?;
            let added = client.add_attachments(vec![file]).await?;
            if added == 0 {
                eprintln!("{} was not attached", path.display());
            }
        }
        Intent::Detach(index) => {
            if !client.remove_attachment(index).await? {
                eprintln!("no staged image {index}");
            }
        }
        Intent::Delete(index) => {
            if client.delete_message_pair(index).await? == 0 {
                eprintln!("no message {index}");
            }
        }
        Intent::Clear => client.clear_history().await?,
        Intent::Cancel => {
            client.cancel_response().await?;
        }
        Intent::SwitchUser(raw) => {
            client.switch_user(parse_user_id(&raw)?).await?;
        }
        Intent::Show => print!("{}", render::transcript(&client.render_model())),
        Intent::Help => println!("{HELP}"),
        Intent::Quit => {}
    }
    Ok(())
}

async fn print_updates(mut updates: watch::Receiver<RenderModel>) {
    let mut printer = StreamPrinter::default();
    loop {
        let output = {
            let model = updates.borrow_and_update();
            printer.update(&model)
        };
        if !output.is_empty() {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(output.as_bytes());
            let _ = stdout.flush();
        }

        if updates.changed().await.is_err() {
            break;
        }
    }
}
