use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use coursehub::config::CoursehubConfig;
use coursehub::domain::{
    AccountId, CourseChanges, CourseId, GroupId, LessonId, NewAccount, NewCourse, NewLesson,
    Profile,
};
use coursehub::policy::{Caller, Principal};
use coursehub::{enrollment_metrics, init_telemetry, ApiResponse, CourseApi, SqliteStore};

#[derive(Parser)]
#[command(name = "coursehub")]
#[command(about = "Course sales with balances and capacity-limited groups")]
#[command(long_about = "coursehub sells courses against an internal cash balance and seats \
                       every buyer in one of the course's groups. Commands run as the local \
                       operator unless --as selects an account.")]
struct Cli {
    /// Database URL, overrides the configured one
    #[arg(long, global = true, value_name = "URL")]
    database: Option<String>,

    /// Run the command as this account instead of the local operator
    #[arg(long = "as", global = true, value_name = "ACCOUNT_ID")]
    as_account: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database if needed and apply migrations
    Migrate,
    /// Manage accounts and balances
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Manage and buy courses
    Course {
        #[command(subcommand)]
        command: CourseCommands,
    },
    /// Manage lessons of a course
    Lesson {
        #[command(subcommand)]
        command: LessonCommands,
    },
    /// Manage groups of a course
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Create an account with its starting balance
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Grant staff privileges
        #[arg(long)]
        staff: bool,
        /// Grant superuser privileges
        #[arg(long)]
        superuser: bool,
    },
    /// List all accounts, newest first
    List,
    /// Show an account with its balance and purchases
    Show { id: i64 },
    /// Credit cash to an account
    TopUp { id: i64, amount: u64 },
}

#[derive(Subcommand)]
enum CourseCommands {
    /// Create a course; ten groups are provisioned with it
    Create {
        #[arg(long)]
        author: i64,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "0")]
        price: u64,
    },
    /// List all courses with statistics
    List,
    /// Show one course
    Show { id: i64 },
    /// Change title or price of a course
    Update {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        price: Option<u64>,
    },
    /// Delete a course with its lessons and groups
    Delete { id: i64 },
    /// Buy a course and join a group (requires --as)
    Pay {
        id: i64,
        /// JSON payload echoed back on success
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// List courses not yet bought (requires --as)
    ForBuy,
    /// List groups of a course with their students
    Groups { id: i64 },
}

#[derive(Subcommand)]
enum LessonCommands {
    /// Add a lesson to a course
    Add {
        #[arg(long)]
        course: i64,
        #[arg(long)]
        title: String,
        #[arg(long)]
        link: String,
    },
    /// List lessons of a course
    List { course: i64 },
    /// Remove a lesson from a course
    Delete { course: i64, lesson: i64 },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Add an extra group to a course
    Add {
        #[arg(long)]
        course: i64,
        #[arg(long)]
        title: String,
    },
    /// Delete a group of a course
    Delete { course: i64, group: i64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tokio::runtime::Runtime::new()?.block_on(async { run(cli).await })
}

/// The local operator acts with full privileges
fn operator() -> Caller {
    Caller::Authenticated(Principal {
        account: AccountId(0),
        is_staff: true,
        is_superuser: true,
        owned_courses: Vec::new(),
    })
}

async fn run(cli: Cli) -> Result<()> {
    let _ = CoursehubConfig::load_env_file();
    let config = CoursehubConfig::load().context("Failed to load configuration")?;
    init_telemetry(&config.observability)?;

    let database = config.database.clone();
    let url = match (&cli.database, &database) {
        (Some(url), _) => url.clone(),
        (None, Some(db)) => db.url.clone(),
        (None, None) => bail!("No database configured; pass --database or set COURSEHUB_DATABASE__URL"),
    };
    let max_connections = database.as_ref().map(|db| db.max_connections).unwrap_or(5);
    let auto_migrate = database.as_ref().map(|db| db.auto_migrate).unwrap_or(true);

    ensure_database_dir(&url)?;
    let store = Arc::new(SqliteStore::connect(&url, max_connections, auto_migrate).await?);

    if let Commands::Migrate = cli.command {
        store.migrate().await?;
        println!("✅ Database ready at {url}");
        store.shutdown().await;
        return Ok(());
    }

    let api = CourseApi::new(store.clone(), config.accounts.initial_balance);
    let caller = match cli.as_account {
        Some(id) => api
            .resolve_caller(AccountId(id))
            .await
            .with_context(|| format!("Cannot act as account {id}"))?,
        None => operator(),
    };

    let response = dispatch(&api, &caller, cli.as_account, cli.command).await?;
    enrollment_metrics().log_stats();
    store.shutdown().await;
    report(&response)
}

/// Create the directory holding a file-backed SQLite database
fn ensure_database_dir(url: &str) -> Result<()> {
    let path = url.trim_start_matches("sqlite:").trim_start_matches("//");
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

async fn dispatch(
    api: &CourseApi<SqliteStore>,
    caller: &Caller,
    as_account: Option<i64>,
    command: Commands,
) -> Result<ApiResponse> {
    let response = match command {
        Commands::Migrate => unreachable!("handled before dispatch"),
        Commands::Account { command } => match command {
            AccountCommands::Create {
                email,
                username,
                first_name,
                last_name,
                staff,
                superuser,
            } => {
                let new = NewAccount {
                    profile: Profile {
                        email,
                        username,
                        first_name,
                        last_name,
                    },
                    is_staff: staff,
                    is_superuser: superuser,
                };
                api.create_account(caller, new).await
            }
            AccountCommands::List => api.list_accounts(caller).await,
            AccountCommands::Show { id } => api.get_account(caller, AccountId(id)).await,
            AccountCommands::TopUp { id, amount } => {
                api.top_up(caller, AccountId(id), amount).await
            }
        },
        Commands::Course { command } => match command {
            CourseCommands::Create {
                author,
                title,
                price,
            } => {
                let new = NewCourse {
                    author: AccountId(author),
                    title,
                    price,
                };
                api.create_course(caller, new).await
            }
            CourseCommands::List => api.list_courses(caller).await,
            CourseCommands::Show { id } => api.retrieve_course(caller, CourseId(id)).await,
            CourseCommands::Update { id, title, price } => {
                api.update_course(caller, CourseId(id), CourseChanges { title, price })
                    .await
            }
            CourseCommands::Delete { id } => api.delete_course(caller, CourseId(id)).await,
            CourseCommands::Pay { id, payload } => {
                if as_account.is_none() {
                    bail!("Paying for a course needs a buyer; pass --as <ACCOUNT_ID>");
                }
                let payload: Value =
                    serde_json::from_str(&payload).context("Payload is not valid JSON")?;
                api.pay(caller, CourseId(id), payload).await
            }
            CourseCommands::ForBuy => {
                if as_account.is_none() {
                    bail!("Listing purchasable courses needs an account; pass --as <ACCOUNT_ID>");
                }
                api.for_buy(caller).await
            }
            CourseCommands::Groups { id } => api.course_groups(caller, CourseId(id)).await,
        },
        Commands::Lesson { command } => match command {
            LessonCommands::Add {
                course,
                title,
                link,
            } => {
                api.create_lesson(caller, CourseId(course), NewLesson { title, link })
                    .await
            }
            LessonCommands::List { course } => api.list_lessons(caller, CourseId(course)).await,
            LessonCommands::Delete { course, lesson } => {
                api.delete_lesson(caller, CourseId(course), LessonId(lesson))
                    .await
            }
        },
        Commands::Group { command } => match command {
            GroupCommands::Add { course, title } => {
                api.create_group(caller, CourseId(course), title).await
            }
            GroupCommands::Delete { course, group } => {
                api.delete_group(caller, CourseId(course), GroupId(group))
                    .await
            }
        },
    };
    Ok(response)
}

fn report(response: &ApiResponse) -> Result<()> {
    let code = response.status.code();
    if response.status.is_success() {
        println!("✅ {code}");
    } else {
        println!("❌ {code}");
    }
    if !response.body.is_null() {
        println!("{}", serde_json::to_string_pretty(&response.body)?);
    }

    if response.status.is_success() {
        Ok(())
    } else {
        bail!("request failed with status {code}")
    }
}
