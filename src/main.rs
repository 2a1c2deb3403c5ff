mod api;

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, NewTodo, Routine};
use mentor_backend::goals::Goal;
use mentor_backend::reports::ReportKind;
use mentor_backend::todos::{Priority, RecurrenceType, Todo};

/// Terminal client for the mentor coaching backend.
#[derive(Parser, Debug)]
#[command(name = "mentor", version, about)]
struct Cli {
    /// User the session belongs to
    #[arg(long, short, env = "MENTOR_USER_ID")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask for today's opening question
    Start,

    /// Send one message, or chat interactively when no message is given
    Chat {
        message: Vec<String>,
    },

    /// Show today's and yesterday's routines
    Routines,

    /// Mark a routine as done (or undo it)
    Check {
        routine_id: String,

        #[arg(long)]
        undo: bool,
    },

    /// Manage goals
    #[command(subcommand)]
    Goals(GoalCommand),

    /// Manage to-dos
    #[command(subcommand)]
    Todos(TodoCommand),

    /// Show a review; without a kind the due automatic review is run
    Report {
        #[arg(value_enum)]
        kind: Option<ReportKindArg>,
    },
}

#[derive(Subcommand, Debug)]
enum GoalCommand {
    List,
    Add {
        titel: String,

        #[arg(long)]
        deadline: Option<String>,
    },
    /// Set a goal's status, e.g. "erreicht"
    Set { id: i64, status: String },
}

#[derive(Subcommand, Debug)]
enum TodoCommand {
    List {
        /// Include archived to-dos
        #[arg(long)]
        all: bool,
    },
    Add {
        title: String,

        /// low, medium or high
        #[arg(long, value_parser = parse_priority)]
        priority: Option<Priority>,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<NaiveDate>,

        #[arg(long)]
        category: Option<String>,

        /// daily, weekly, monthly, monthly_first or yearly
        #[arg(long, value_parser = parse_recurrence)]
        repeat: Option<RecurrenceType>,
    },
    Done { id: String },
    Delete { id: String },
    Stats,
    Cleanup,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ReportKindArg {
    Weekly,
    Monthly,
}

impl From<ReportKindArg> for ReportKind {
    fn from(arg: ReportKindArg) -> Self {
        match arg {
            ReportKindArg::Weekly => ReportKind::Weekly,
            ReportKindArg::Monthly => ReportKind::Monthly,
        }
    }
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" => Ok(Priority::Low),
        "medium" => Ok(Priority::Medium),
        "high" => Ok(Priority::High),
        other => Err(format!("unknown priority '{}'", other)),
    }
}

fn parse_recurrence(raw: &str) -> Result<RecurrenceType, String> {
    RecurrenceType::from_db(&raw.trim().to_ascii_lowercase())
        .ok_or_else(|| format!("unknown recurrence '{}'", raw))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mentor=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = ApiClient::from_env();
    tracing::debug!("Backend API: {}", client.base_url());

    let rt = tokio::runtime::Runtime::new().context("failed to start client runtime")?;
    rt.block_on(run(cli, client))
}

async fn run(cli: Cli, client: ApiClient) -> Result<()> {
    let user = cli.user.as_str();
    match cli.command {
        Command::Start => {
            println!("{}", client.start_interaction(user).await?);
        }
        Command::Chat { message } if !message.is_empty() => {
            println!("{}", client.chat(user, &message.join(" ")).await?);
        }
        Command::Chat { .. } => interactive_chat(&client, user).await?,
        Command::Routines => {
            println!("{}", format_routines(&client.list_routines(user).await?));
        }
        Command::Check { routine_id, undo } => {
            client.set_routine_checked(user, &routine_id, !undo).await?;
            println!("{}", if undo { "Zurückgesetzt." } else { "Erledigt!" });
        }
        Command::Goals(command) => run_goal_command(&client, user, command).await?,
        Command::Todos(command) => run_todo_command(&client, user, command).await?,
        Command::Report { kind: Some(kind) } => {
            println!("{}", client.fetch_report(user, kind.into()).await?);
        }
        Command::Report { kind: None } => {
            let review = client.automatic_report(user).await?;
            match (review.typ, review.inhalt) {
                (None, _) => println!("Heute ist kein Rückblick fällig."),
                (Some(label), Some(inhalt)) => println!("{}\n\n{}", label, inhalt),
                (Some(label), None) => match ReportKind::from_label(&label) {
                    Some(kind) => println!("{}", client.fetch_report(user, kind).await?),
                    None => println!("{} wurde bereits erstellt.", label),
                },
            }
        }
    }
    Ok(())
}

async fn interactive_chat(client: &ApiClient, user: &str) -> Result<()> {
    println!("Berater: {}", client.start_interaction(user).await?);

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("Du: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if matches!(message, "exit" | "quit" | "tschüss") {
            break;
        }
        match client.chat(user, message).await {
            Ok(reply) => println!("Berater: {}", reply),
            Err(e) => eprintln!("Fehler: {:#}", e),
        }
    }
    Ok(())
}

async fn run_goal_command(client: &ApiClient, user: &str, command: GoalCommand) -> Result<()> {
    match command {
        GoalCommand::List => println!("{}", format_goals(&client.list_goals(user).await?)),
        GoalCommand::Add { titel, deadline } => {
            let goal = client.create_goal(user, &titel, deadline.as_deref()).await?;
            println!("Ziel #{} angelegt: {}", goal.id, goal.titel);
        }
        GoalCommand::Set { id, status } => {
            client.update_goal(user, id, &status).await?;
            println!("Ziel #{} ist jetzt '{}'.", id, status);
        }
    }
    Ok(())
}

async fn run_todo_command(client: &ApiClient, user: &str, command: TodoCommand) -> Result<()> {
    match command {
        TodoCommand::List { all } => {
            let todos = client.list_todos(user, all).await?;
            println!("{}", format_todos(&todos, Utc::now().date_naive()));
        }
        TodoCommand::Add {
            title,
            priority,
            due,
            category,
            repeat,
        } => {
            let todo = client
                .create_todo(
                    user,
                    &NewTodo {
                        title,
                        priority,
                        due_date: due,
                        category,
                        is_recurring: repeat.is_some(),
                        recurrence_type: repeat,
                    },
                )
                .await?;
            println!("To-Do angelegt: {} ({})", todo.title, todo.id);
        }
        TodoCommand::Done { id } => {
            let outcome = client.complete_todo(user, &id).await?;
            println!("Erledigt: {}", outcome.completed.title);
            if let Some(next) = outcome.spawned {
                let due = next
                    .due_date
                    .map(|d| d.format("%d.%m.%Y").to_string())
                    .unwrap_or_else(|| "ohne Datum".to_string());
                println!("Nächste Wiederholung: {} (fällig {})", next.title, due);
            }
        }
        TodoCommand::Delete { id } => {
            client.delete_todo(user, &id).await?;
            println!("Gelöscht.");
        }
        TodoCommand::Stats => {
            let stats = client.todo_stats(user).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        TodoCommand::Cleanup => {
            let archived = client.cleanup_todos(user).await?;
            println!("{} To-Do(s) archiviert.", archived);
        }
    }
    Ok(())
}

fn format_routines(routines: &[Routine]) -> String {
    if routines.is_empty() {
        return "Keine Routinen für heute oder gestern.".to_string();
    }
    routines
        .iter()
        .map(|r| {
            let mark = if r.checked { "[x]" } else { "[ ]" };
            let time = if r.time.is_empty() {
                String::new()
            } else {
                format!(" {}", r.time)
            };
            let missed = if r.missed_count > 0 {
                format!(", {}x verpasst", r.missed_count)
            } else {
                String::new()
            };
            format!("{} {} ({}{}{}) id={}", mark, r.task, r.display_date, time, missed, r.id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_goals(goals: &[Goal]) -> String {
    if goals.is_empty() {
        return "Keine Ziele.".to_string();
    }
    goals
        .iter()
        .map(|g| {
            if g.deadline.is_empty() {
                format!("#{} {} [{}]", g.id, g.titel, g.status)
            } else {
                format!("#{} {} [{}] bis {}", g.id, g.titel, g.status, g.deadline)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_todos(todos: &[Todo], today: NaiveDate) -> String {
    if todos.is_empty() {
        return "Keine To-Dos.".to_string();
    }
    todos
        .iter()
        .map(|t| {
            let mut line = format!(
                "- {} [{}, {}, {}]",
                t.title,
                t.status.as_db_str(),
                t.priority.as_db_str(),
                t.category
            );
            if let Some(due) = t.due_date {
                line.push_str(&format!(" fällig {}", due.format("%d.%m.%Y")));
                if t.is_overdue(today) {
                    line.push_str(" (überfällig)");
                }
            }
            if t.is_recurring {
                line.push_str(" ↻");
            }
            line.push_str(&format!(" id={}", t.id));
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
