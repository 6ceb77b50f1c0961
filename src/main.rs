use anyhow::{anyhow, bail, Result};
use booklog::config::Config;
use booklog::models::{Book, BookFilter, BookId, ReadingStatus, SearchResult, Stats, User};
use booklog::{
    ApiClient, BookCollection, BookForm, BookLogApi, FileTokenStore, FormField, SessionStore,
    SubmitOutcome, TokenStore,
};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "booklog")]
#[command(version, about = "Keep a log of the books you read", long_about = None)]
struct Cli {
    /// Backend base URL (default: http://localhost:5000/api)
    #[arg(long, env = "BOOKLOG_API_URL")]
    api_url: Option<String>,

    /// Where the session token is kept between runs
    #[arg(long, env = "BOOKLOG_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account and sign in
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: String,
    },
    /// Sign in with an existing account
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// List books, optionally filtered
    List {
        #[arg(long)]
        status: Option<ReadingStatus>,
        #[arg(long)]
        author: Option<String>,
    },
    /// Show reading statistics
    Stats,
    /// Look a book up in the external catalogue
    Search { query: String },
    /// Add a book
    Add {
        #[command(flatten)]
        fields: BookFields,
        /// Fill blank fields from a catalogue search
        #[arg(long)]
        from_search: Option<String>,
        /// Which search hit to use (1-based)
        #[arg(long, default_value_t = 1)]
        pick: usize,
    },
    /// Change an existing book
    Edit {
        id: BookId,
        #[command(flatten)]
        fields: BookFields,
    },
    /// Remove a book
    Delete { id: BookId },
}

#[derive(Args, Debug, Default)]
struct BookFields {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    author: Option<String>,
    #[arg(long)]
    status: Option<ReadingStatus>,
    /// 1-5, only for finished or abandoned books
    #[arg(long)]
    rating: Option<String>,
    #[arg(long)]
    pages: Option<String>,
    #[arg(long)]
    isbn: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    cover_url: Option<String>,
    /// YYYY-MM-DD, only for finished books
    #[arg(long)]
    finished_on: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

struct App {
    api: Arc<dyn BookLogApi>,
    session: SessionStore,
    books: BookCollection,
}

impl App {
    fn new(config: &Config) -> Result<Self> {
        let tokens: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(&config.token_file));
        let api: Arc<dyn BookLogApi> = Arc::new(ApiClient::new(&config.api_url, tokens.clone())?);
        Ok(Self {
            session: SessionStore::new(api.clone(), tokens),
            books: BookCollection::new(api.clone()),
            api,
        })
    }

    async fn require_session(&self) -> Result<User> {
        self.session
            .restore()
            .await
            .ok_or_else(|| anyhow!("Not logged in. Run `booklog login` first."))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = dotenv();
    init_tracing();
    match env_file {
        Ok(path) => debug!("Loaded environment from {:?}", path),
        Err(e) => debug!("No .env file loaded ({}) - relying on environment", e),
    }

    let cli = Cli::parse();
    let config = Config::resolve(cli.api_url, cli.token_file)?;
    let app = App::new(&config)?;
    run(&app, cli.command).await
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Register {
            email,
            password,
            name,
        } => {
            let user = app.session.register(&email, &password, &name).await?;
            println!("Welcome, {}!", user.name);
        }
        Command::Login { email, password } => {
            let user = app.session.login(&email, &password).await?;
            println!("Signed in as {} <{}>", user.name, user.email);
        }
        Command::Logout => {
            app.session.logout();
            println!("Signed out.");
        }
        Command::Whoami => match app.session.restore().await {
            Some(user) => println!("{} <{}>", user.name, user.email),
            None => println!("Not logged in."),
        },
        Command::List { status, author } => {
            app.require_session().await?;
            let loaded = app.books.load(BookFilter { status, author }).await;
            print_books(&app.books.books());
            if let Some(stats) = app.books.stats() {
                println!();
                print_stats(&stats);
            }
            loaded?;
        }
        Command::Stats => {
            app.require_session().await?;
            print_stats(&app.api.stats().await?);
        }
        Command::Search { query } => {
            app.require_session().await?;
            let results = app.api.search(query.trim()).await?;
            if results.is_empty() {
                println!("No results - fill in manually with `booklog add`.");
            }
            for (i, result) in results.iter().enumerate() {
                println!("{:>2}. {}", i + 1, describe_result(result));
            }
        }
        Command::Add {
            fields,
            from_search,
            pick,
        } => {
            app.require_session().await?;
            let form = BookForm::new_entry(app.api.clone());
            apply_fields(&form, fields);
            if let Some(query) = from_search {
                let results = app.api.search(query.trim()).await?;
                let hit = pick
                    .checked_sub(1)
                    .and_then(|i| results.get(i))
                    .ok_or_else(|| anyhow!("No search result #{} for '{}'", pick, query))?;
                debug!("Filling from search hit: {}", describe_result(hit));
                form.select_result(hit);
            }
            let book = finish(form.submit_to(&app.books).await)?;
            println!("Added:");
            print_books(std::slice::from_ref(&book));
        }
        Command::Edit { id, fields } => {
            app.require_session().await?;
            let book = app.api.get_book(id).await?;
            let form = BookForm::edit(app.api.clone(), &book);
            apply_fields(&form, fields);
            let book = finish(form.submit_to(&app.books).await)?;
            println!("Updated:");
            print_books(std::slice::from_ref(&book));
        }
        Command::Delete { id } => {
            app.require_session().await?;
            app.books.delete(id).await?;
            println!("Removed book {}.", id);
        }
    }
    Ok(())
}

// status goes first so a rating given alongside it is accepted
fn apply_fields(form: &BookForm, fields: BookFields) {
    if let Some(status) = fields.status {
        form.set_status(status);
    }
    if fields.rating.is_some() && !form.can_rate() {
        warn!("Ignoring --rating: only finished or abandoned books can be rated");
    }
    if fields.finished_on.is_some() && !form.shows_date_finished() {
        warn!("Ignoring --finished-on: the book is not marked finished");
    }
    let updates = [
        (FormField::Title, fields.title),
        (FormField::Author, fields.author),
        (FormField::Rating, fields.rating),
        (FormField::PageCount, fields.pages),
        (FormField::Isbn, fields.isbn),
        (FormField::Notes, fields.notes),
        (FormField::CoverUrl, fields.cover_url),
        (FormField::DateFinished, fields.finished_on),
    ];
    for (field, value) in updates {
        if let Some(value) = value {
            form.set_field(field, value);
        }
    }
}

fn finish(outcome: SubmitOutcome) -> Result<Book> {
    match outcome {
        SubmitOutcome::Saved(book) => Ok(book),
        SubmitOutcome::Rejected(message) => bail!("{}", message),
        SubmitOutcome::Busy | SubmitOutcome::Closed => bail!("The form is not accepting changes"),
    }
}

fn stars(rating: Option<u8>) -> String {
    match rating {
        Some(r) => {
            let r = usize::from(r.min(5));
            format!("{}{}", "★".repeat(r), "☆".repeat(5 - r))
        }
        None => "-".to_string(),
    }
}

fn print_books(books: &[Book]) {
    if books.is_empty() {
        println!("No books yet.");
        return;
    }
    for book in books {
        let date = book
            .date_finished
            .or(book.date_added)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        let pages = book
            .page_count
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5}  {} by {}  [{}]  {}  {} pages  {}",
            book.id,
            book.title,
            book.author,
            book.status.label(),
            stars(book.rating),
            pages,
            date
        );
        if let Some(isbn) = &book.isbn {
            println!("       ISBN: {}", isbn);
        }
    }
}

fn print_stats(stats: &Stats) {
    let avg = stats
        .avg_rating
        .map(|a| format!("{:.2}", a))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "Total: {}  Finished: {}  Reading: {}  Avg rating: {}  Pages read: {}",
        stats.total, stats.finished, stats.reading, avg, stats.total_pages
    );
}

fn describe_result(result: &SearchResult) -> String {
    let mut line = result.title.clone();
    if !result.author.is_empty() {
        line.push_str(&format!(" - {}", result.author));
    }
    if let Some(pages) = result.page_count {
        line.push_str(&format!(" · {} pages", pages));
    }
    line
}
