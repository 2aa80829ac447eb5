use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use shelf_upload::{
    auth::AuthStore,
    config::Config,
    forms::{BookForm, CategoryForm, SITE_SETTINGS_COLLECTION, SiteSettingsForm},
    progress::{NullReporter, ProgressReporter, create_reporter},
    record_store::RecordStore,
    upload::{FileBlob, Outcome, UploadRequest, Uploaded, Uploader},
};
use tracing::{error, info, warn};

#[derive(Parser)]
struct Opts {
    #[clap(short, long, env = "SHELF_UPLOAD_CONFIG", default_value = "shelf-upload.yaml")]
    config: PathBuf,
    /// Log in with this identity before uploading.
    #[clap(long, env = "SHELF_UPLOAD_IDENTITY")]
    identity: Option<String>,
    #[clap(long, env = "SHELF_UPLOAD_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Do not display upload progress.
    #[clap(short, long)]
    quiet: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or update a book.
    Book(BookArgs),
    /// Create or update the site settings.
    Settings(SettingsArgs),
    /// Create a book category.
    Category(CategoryArgs),
}

#[derive(Args)]
struct BookArgs {
    /// Record to update. A new book is created when omitted.
    #[clap(long)]
    id: Option<String>,
    #[clap(long)]
    title: String,
    #[clap(long)]
    author: String,
    #[clap(long, default_value = "")]
    description: String,
    /// Category record id.
    #[clap(long, default_value = "")]
    category: String,
    #[clap(long, default_value = "")]
    isbn: String,
    #[clap(long)]
    published_date: Option<chrono::NaiveDate>,
    #[clap(long, default_value = "")]
    edition: String,
    #[clap(long, default_value = "")]
    subtitle: String,
    #[clap(long)]
    cover: Option<PathBuf>,
    #[clap(long)]
    document: Option<PathBuf>,
}

#[derive(Args)]
struct SettingsArgs {
    /// Settings record to update. Defaults to the existing settings record,
    /// which is created when there is none.
    #[clap(long)]
    id: Option<String>,
    #[clap(long, default_value = "")]
    site_title: String,
    #[clap(long, default_value = "")]
    site_description: String,
    #[clap(long, default_value = "")]
    subtitle: String,
    #[clap(long, default_value = "")]
    quote: String,
    #[clap(long, default_value = "")]
    quote_name: String,
    #[clap(long, default_value = "")]
    hero_caption: String,
    #[clap(long)]
    hero_photo: Option<PathBuf>,
}

#[derive(Args)]
struct CategoryArgs {
    #[clap(long)]
    name: String,
}

/// Exit status of a run the user cancelled.
const CANCELLED_EXIT_CODE: i32 = 130;

async fn load_blob(path: Option<&Path>) -> anyhow::Result<Option<FileBlob>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let blob = FileBlob::from_path(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    Ok(Some(blob))
}

async fn build_request(
    command: Command,
    store: &RecordStore,
    auth: &AuthStore,
) -> anyhow::Result<UploadRequest> {
    match command {
        Command::Book(args) => {
            let form = BookForm {
                title: args.title,
                author: args.author,
                description: args.description,
                category: args.category,
                isbn: args.isbn,
                published_date: args.published_date,
                edition: args.edition,
                subtitle: args.subtitle,
                cover: load_blob(args.cover.as_deref()).await?,
                document: load_blob(args.document.as_deref()).await?,
            };
            Ok(form.into_request(args.id))
        }
        Command::Settings(args) => {
            let id = match args.id {
                Some(id) => Some(id),
                None => store
                    .first_record(auth, SITE_SETTINGS_COLLECTION)
                    .await
                    .context("look up the site settings")?
                    .and_then(|record| record.id().map(str::to_owned)),
            };
            let form = SiteSettingsForm {
                site_title: args.site_title,
                site_description: args.site_description,
                subtitle: args.subtitle,
                quote: args.quote,
                quote_name: args.quote_name,
                hero_caption: args.hero_caption,
                hero_photo: load_blob(args.hero_photo.as_deref()).await?,
            };
            Ok(form.into_request(id))
        }
        Command::Category(args) => Ok(CategoryForm { name: args.name }.into_request()),
    }
}

/// `None` when the user cancelled the upload; cancellation is not a failure.
fn settle(outcome: Outcome) -> anyhow::Result<Option<Uploaded>> {
    match outcome {
        Ok(uploaded) => Ok(Some(uploaded)),
        Err(e) if e.is_aborted() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Returns `false` when the upload was cancelled.
async fn run(opts: Opts) -> anyhow::Result<bool> {
    let config = Config::load(&opts.config)
        .await
        .with_context(|| format!("load config from {}", opts.config.display()))?;
    let store = RecordStore::new(config.base_url.clone());
    let auth = match &config.auth.token {
        Some(token) => AuthStore::with_token(token),
        None => AuthStore::default(),
    };
    match (&opts.identity, &opts.password) {
        (Some(identity), Some(password)) => {
            store
                .auth_with_password(&auth, &config.auth.collection, identity, password)
                .await
                .with_context(|| format!("log in as {identity}"))?;
            info!(identity, "logged in");
        }
        (None, None) => {}
        _ => bail!("--identity and --password must be given together"),
    }

    let request = build_request(opts.command, &store, &auth).await?;
    let base_url = store.base_url().clone();
    let uploader = Uploader::new(store, base_url, auth, config.upload);
    let reporter: Arc<dyn ProgressReporter> = if opts.quiet {
        Arc::new(NullReporter)
    } else {
        create_reporter()
    };
    let session = uploader.submit(request, reporter.clone());

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling upload");
            cancel.cancel();
        }
    });

    let outcome = session.await;
    reporter.finish();
    let Some(uploaded) = settle(outcome)? else {
        info!("upload cancelled");
        return Ok(false);
    };
    println!("{}", serde_json::to_string_pretty(&uploaded.record)?);
    Ok(true)
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    match run(opts).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(CANCELLED_EXIT_CODE),
        Err(e) => {
            error!(?e, "critical error");
            std::process::exit(1);
        }
    }
}
