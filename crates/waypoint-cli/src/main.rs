//! Waypoint CLI - Command line interface for the Waypoint control plane.

use clap::{Args, Parser, Subcommand};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use waypoint_cli::{ClientError, HttpClient, TaskProgress};
use waypoint_core::{Checkpoint, Task, TaskFilters, TaskId, TaskState, TaskType, Worker, WorkerId};

/// Waypoint CLI - Control plane management tool
#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "CLI for the Waypoint control plane", long_about = None)]
struct Cli {
    /// Control plane address
    #[arg(short, long, default_value = "http://[::1]:50052")]
    addr: String,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task submission and lifecycle commands
    #[command(subcommand)]
    Tasks(TaskCommands),

    /// Worker inspection and maintenance
    #[command(subcommand)]
    Workers(WorkerCommands),

    /// Check control plane health
    Health,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Submit a new task
    Create {
        /// Capability tag a worker must advertise
        #[arg(short = 't', long = "type")]
        task_type: String,

        /// Submitting owner
        #[arg(short, long)]
        owner: String,

        /// Payload JSON handed to the worker
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Attempt budget (server default when omitted)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Task that must complete first (repeatable)
        #[arg(short = 'd', long = "depends-on")]
        depends_on: Vec<String>,
    },

    /// List tasks
    List(ListArgs),

    /// Show one task
    Get { id: String },

    /// Cancel a task
    Cancel { id: String },

    /// Pause a running task
    Pause { id: String },

    /// Resume a paused task
    Resume { id: String },

    /// Assign a pending task to a specific worker
    Assign {
        id: String,

        #[arg(short, long)]
        worker: String,
    },

    /// Show the checkpoint history of a task
    Checkpoints {
        id: String,

        /// Only the most recent checkpoint
        #[arg(long)]
        latest: bool,
    },

    /// Delete one checkpoint, or the whole history
    DeleteCheckpoints {
        id: String,

        /// Only this sequence number
        #[arg(short, long)]
        sequence: Option<u64>,
    },

    /// Show progress, resume point and unfinished dependencies
    Progress { id: String },
}

#[derive(Args)]
struct ListArgs {
    /// Filter by state (pending, assigned, running, paused, completed, failed, cancelled)
    #[arg(short, long)]
    state: Option<TaskState>,

    /// Filter by owner
    #[arg(short, long)]
    owner: Option<String>,

    /// Filter by task type
    #[arg(short = 't', long = "type")]
    task_type: Option<String>,

    /// Page size
    #[arg(short, long)]
    limit: Option<usize>,

    /// Continue after this task id
    #[arg(long)]
    after: Option<String>,

    /// Follow cursors and print every matching task
    #[arg(long, conflicts_with = "after")]
    all: bool,
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// List registered workers
    List,

    /// Show one worker
    Get { id: String },

    /// Stop routing new tasks to a worker
    Drain { id: String },

    /// Remove an idle worker
    Deregister { id: String },

    /// Worker counts by status
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = HttpClient::new(&cli.addr);

    run(&client, cli.command, cli.json).await?;
    Ok(())
}

async fn run(client: &HttpClient, command: Commands, json: bool) -> Result<(), ClientError> {
    match command {
        Commands::Tasks(command) => run_task_command(client, command, json).await,
        Commands::Workers(command) => run_worker_command(client, command, json).await,
        Commands::Health => {
            if client.health().await? {
                println!("{}: ok", client.base_url());
                Ok(())
            } else {
                Err(ClientError::Connection(format!("{} is not healthy", client.base_url())))
            }
        }
    }
}

async fn run_task_command(
    client: &HttpClient,
    command: TaskCommands,
    json: bool,
) -> Result<(), ClientError> {
    match command {
        TaskCommands::Create {
            task_type,
            owner,
            payload,
            max_attempts,
            depends_on,
        } => {
            let payload: Value = serde_json::from_str(&payload)
                .map_err(|e| ClientError::InvalidInput(format!("payload is not JSON: {e}")))?;
            let dependencies: Vec<TaskId> = depends_on.into_iter().map(TaskId::new).collect();
            let task = client
                .create_task(&task_type, &owner, payload, max_attempts, &dependencies)
                .await?;
            output_task(&task, json, Some("Task created:"))
        }
        TaskCommands::List(args) => list_tasks(client, args, json).await,
        TaskCommands::Get { id } => {
            let task = client.get_task(&TaskId::new(id)).await?;
            output_task(&task, json, None)
        }
        TaskCommands::Cancel { id } => {
            let task = client.cancel_task(&TaskId::new(id)).await?;
            output_task(&task, json, Some("Task cancelled:"))
        }
        TaskCommands::Pause { id } => {
            let task = client.pause_task(&TaskId::new(id)).await?;
            output_task(&task, json, Some("Task paused:"))
        }
        TaskCommands::Resume { id } => {
            let task = client.resume_task(&TaskId::new(id)).await?;
            output_task(&task, json, Some("Task resumed:"))
        }
        TaskCommands::Assign { id, worker } => {
            let task = client
                .assign_task(&TaskId::new(id), &WorkerId::new(worker))
                .await?;
            output_task(&task, json, Some("Task assigned:"))
        }
        TaskCommands::Checkpoints { id, latest } => {
            let id = TaskId::new(id);
            let checkpoints = if latest {
                vec![client.latest_checkpoint(&id).await?]
            } else {
                client.checkpoints(&id).await?
            };
            if json {
                return print_json(&checkpoints);
            }
            print_checkpoints(&checkpoints);
            Ok(())
        }
        TaskCommands::DeleteCheckpoints { id, sequence } => {
            let id = TaskId::new(id);
            match sequence {
                Some(sequence) => {
                    client.delete_checkpoint(&id, sequence).await?;
                    println!("Deleted checkpoint {sequence} of {id}");
                }
                None => {
                    let deleted = client.delete_all_checkpoints(&id).await?;
                    println!("Deleted {deleted} checkpoint(s) of {id}");
                }
            }
            Ok(())
        }
        TaskCommands::Progress { id } => {
            let progress = client.task_progress(&TaskId::new(id)).await?;
            if json {
                return print_json(&progress);
            }
            print_progress(&progress);
            Ok(())
        }
    }
}

async fn list_tasks(client: &HttpClient, args: ListArgs, json: bool) -> Result<(), ClientError> {
    let mut filters = TaskFilters::new();
    filters.state = args.state;
    filters.owner = args.owner;
    filters.task_type = args.task_type.map(TaskType::new);
    filters.limit = args.limit;
    filters.after = args.after.map(TaskId::new);

    let (tasks, next_cursor) = if args.all {
        (client.list_all_tasks(filters).await?, None)
    } else {
        let page = client.list_tasks(&filters).await?;
        (page.tasks, page.next_cursor)
    };

    if json {
        return print_json(&tasks);
    }

    println!("Tasks ({}):", tasks.len());
    println!(
        "{:<36}  {:<10}  {:<12}  {:<12}  {:<7}  {}",
        "ID", "STATE", "TYPE", "OWNER", "ATTEMPT", "CREATED"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        println!(
            "{:<36}  {:<10}  {:<12}  {:<12}  {:<7}  {}",
            task.id,
            task.state,
            task.task_type,
            task.owner,
            format!("{}/{}", task.attempt, task.max_attempts),
            format_timestamp(task.created_at)
        );
    }

    if let Some(cursor) = next_cursor {
        println!();
        println!("More results: --after {cursor}");
    }

    Ok(())
}

async fn run_worker_command(
    client: &HttpClient,
    command: WorkerCommands,
    json: bool,
) -> Result<(), ClientError> {
    match command {
        WorkerCommands::List => {
            let workers = client.list_workers().await?;
            if json {
                return print_json(&workers);
            }

            println!("Workers ({}):", workers.len());
            println!(
                "{:<36}  {:<9}  {:<20}  {:<36}  {}",
                "ID", "STATUS", "LAST HEARTBEAT", "TASK", "CAPABILITIES"
            );
            println!("{}", "-".repeat(120));

            for worker in &workers {
                let capabilities: Vec<&str> =
                    worker.capabilities.iter().map(String::as_str).collect();
                println!(
                    "{:<36}  {:<9}  {:<20}  {:<36}  {}",
                    worker.id,
                    worker.status,
                    format_timestamp(worker.last_heartbeat_at),
                    worker.current_task.as_ref().map_or("-", TaskId::as_str),
                    capabilities.join(", ")
                );
            }
            Ok(())
        }
        WorkerCommands::Get { id } => {
            let worker = client.get_worker(&WorkerId::new(id)).await?;
            output_worker(&worker, json, None)
        }
        WorkerCommands::Drain { id } => {
            let worker = client.drain_worker(&WorkerId::new(id)).await?;
            output_worker(&worker, json, Some("Worker draining:"))
        }
        WorkerCommands::Deregister { id } => {
            let worker = client.deregister_worker(&WorkerId::new(id)).await?;
            output_worker(&worker, json, Some("Worker removed:"))
        }
        WorkerCommands::Stats => {
            let stats = client.worker_stats().await?;
            if json {
                return print_json(&stats);
            }
            for key in ["total", "online", "busy", "draining", "offline"] {
                println!("{:<10} {}", key, stats.get(key).and_then(Value::as_u64).unwrap_or(0));
            }
            Ok(())
        }
    }
}

fn output_task(task: &Task, json: bool, header: Option<&str>) -> Result<(), ClientError> {
    if json {
        return print_json(task);
    }
    if let Some(header) = header {
        println!("{header}");
    }
    print_task(task);
    Ok(())
}

fn output_worker(worker: &Worker, json: bool, header: Option<&str>) -> Result<(), ClientError> {
    if json {
        return print_json(worker);
    }
    if let Some(header) = header {
        println!("{header}");
    }
    print_worker(worker);
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), ClientError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ClientError::Serialization(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Type:       {}", task.task_type);
    println!("  Owner:      {}", task.owner);
    println!("  State:      {}", task.state);
    println!("  Attempt:    {}/{}", task.attempt, task.max_attempts);
    println!("  Created:    {}", format_timestamp(task.created_at));

    if !task.dependencies.is_empty() {
        let dependencies: Vec<&str> = task.dependencies.iter().map(TaskId::as_str).collect();
        println!("  Depends on: {}", dependencies.join(", "));
    }
    if let Some(worker) = &task.assigned_worker {
        println!("  Worker:     {worker}");
    }
    if let Some(not_before) = task.not_before {
        println!("  Retry at:   {}", format_timestamp(not_before));
    }
    if let Some(finished) = task.finished_at {
        println!("  Finished:   {}", format_timestamp(finished));
    }
    if let Some(error) = &task.error_message {
        println!("  Error:      {error}");
    }
    if let Some(result) = &task.result {
        println!("  Result:     {result}");
    }
}

fn print_worker(worker: &Worker) {
    let capabilities: Vec<&str> = worker.capabilities.iter().map(String::as_str).collect();

    println!("  ID:             {}", worker.id);
    println!("  Hostname:       {}", worker.hostname);
    println!("  Status:         {}", worker.status);
    println!("  Capabilities:   {}", capabilities.join(", "));
    println!("  Last heartbeat: {}", format_timestamp(worker.last_heartbeat_at));
    if let Some(task) = &worker.current_task {
        println!("  Current task:   {task}");
    }
}

fn print_progress(progress: &TaskProgress) {
    println!("  Task:       {}", progress.task_id);
    println!("  State:      {}", progress.state);
    println!("  Progress:   {}%", progress.percent);
    println!("  Attempt:    {}/{}", progress.attempt, progress.max_attempts);
    match &progress.latest_checkpoint {
        Some(checkpoint) => println!(
            "  Checkpoint: #{} {}",
            checkpoint.sequence,
            checkpoint.name.as_deref().unwrap_or("-")
        ),
        None => println!("  Checkpoint: -"),
    }
    if !progress.blocked_by.is_empty() {
        let blocked_by: Vec<&str> = progress.blocked_by.iter().map(TaskId::as_str).collect();
        println!("  Waiting on: {}", blocked_by.join(", "));
    }
}

fn print_checkpoints(checkpoints: &[Checkpoint]) {
    println!("Checkpoints ({}):", checkpoints.len());
    println!("{:<6}  {:<20}  {:<20}  {}", "SEQ", "NAME", "CREATED", "DATA");
    println!("{}", "-".repeat(80));

    for checkpoint in checkpoints {
        println!(
            "{:<6}  {:<20}  {:<20}  {}",
            checkpoint.sequence,
            checkpoint.name.as_deref().unwrap_or("-"),
            format_timestamp(checkpoint.created_at),
            checkpoint.data
        );
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
