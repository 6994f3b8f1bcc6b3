use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use crate::audit::SledAuditLog;
use crate::config::AppConfig;
use crate::engine::{CallbackPayload, LifecycleEngine};
use crate::model::{Actor, Role, UserRecord};
use crate::operation::NewWorkOrder;
use crate::reconcile::ListFilter;
use crate::response::Envelope;
use crate::store::WorkOrderStore;
use crate::types::{Platform, WorkOrderSubtype};

#[derive(Parser)]
#[command(name = "wo-console")]
#[command(about = "Operate ad account work orders against a local store")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Database path (overrides WO_DB_PATH)")]
    pub db: Option<String>,

    #[arg(long, global = true, env = "WO_USER", default_value = "system", help = "Acting user id")]
    pub user: String,

    #[arg(long, global = true, help = "Act with the reviewer role")]
    pub reviewer: bool,

    #[arg(long, global = true, help = "Act with the admin role")]
    pub admin: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Create a work order from a JSON document ('-' reads stdin)")]
    Create {
        #[arg(help = "NewWorkOrder JSON or '-'")]
        input: String,
    },

    #[command(about = "Patch a modifiable work order by task id")]
    Update {
        task_id: String,
        #[arg(help = "JSON patch or '-'")]
        patch: String,
    },

    #[command(about = "Approve a pending work order and submit it")]
    Approve {
        id: String,
        #[arg(long, help = "Expected subtype, e.g. WITHDRAWAL")]
        subtype: WorkOrderSubtype,
        #[arg(long)]
        remarks: Option<String>,
    },

    #[command(about = "Reject a pending work order")]
    Reject {
        id: String,
        #[arg(long)]
        reason: String,
    },

    #[command(about = "Resubmit a failed or returned work order")]
    Resubmit {
        id: String,
        #[arg(long, help = "Optional JSON patch or '-'")]
        patch: Option<String>,
    },

    #[command(about = "Apply a platform status callback")]
    Callback {
        #[arg(long)]
        platform: Platform,
        #[arg(help = "Callback JSON or '-'")]
        payload: String,
    },

    #[command(about = "Pull the remote status of a work order")]
    Sync { id: String },

    #[command(about = "List the acting user's work orders")]
    List {
        #[arg(long, help = "ListFilter JSON")]
        filter: Option<String>,
    },

    #[command(about = "Show a work order with its exchange log and audit history")]
    Show { id: String },

    #[command(about = "Bind a third-party task id to a work order")]
    Bind { id: String, external_id: String },

    #[command(about = "Soft delete a work order")]
    Delete { id: String },

    #[command(about = "Register a user so it can own work orders")]
    AddUser {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_delimiter = ',', default_value = "OPERATOR")]
        roles: Vec<String>,
    },
}

impl Cli {
    fn actor(&self) -> Actor {
        let mut roles = vec![Role::Operator];
        if self.reviewer {
            roles.push(Role::Reviewer);
        }
        if self.admin {
            roles.push(Role::Admin);
        }
        Actor::new(self.user.clone(), roles)
    }
}

/// Run one command and print its envelope. Returns whether it succeeded.
pub async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = AppConfig::from_env();
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    let store = Arc::new(
        WorkOrderStore::open(&config.db_path)
            .with_context(|| format!("opening store at {}", config.db_path))?,
    );
    let audit = Arc::new(SledAuditLog::new(store.db())?);
    let engine = LifecycleEngine::new(
        store.clone(),
        Arc::new(config.build_adapter()),
        audit,
        config.engine.clone(),
    );
    let actor = cli.actor();

    match cli.command {
        Commands::Create { input } => {
            let input: NewWorkOrder = serde_json::from_value(read_json(&input)?)
                .context("parsing work order input")?;
            print(&engine.create(input, &actor).await)
        }
        Commands::Update { task_id, patch } => {
            print(&engine.update(&task_id, read_json(&patch)?, &actor).await)
        }
        Commands::Approve {
            id,
            subtype,
            remarks,
        } => print(&engine.approve(&id, subtype, &actor, remarks).await),
        Commands::Reject { id, reason } => print(&engine.reject(&id, &actor, &reason).await),
        Commands::Resubmit { id, patch } => {
            let patch = patch.as_deref().map(read_json).transpose()?;
            print(&engine.resubmit(&id, patch, &actor).await)
        }
        Commands::Callback { platform, payload } => {
            let payload: CallbackPayload = serde_json::from_value(read_json(&payload)?)
                .context("parsing callback payload")?;
            print(&engine.handle_callback(platform, payload).await)
        }
        Commands::Sync { id } => print(&engine.query_status(&id, &actor).await),
        Commands::List { filter } => {
            let filter: ListFilter = match filter {
                Some(raw) => serde_json::from_value(read_json(&raw)?).context("parsing filter")?,
                None => ListFilter::default(),
            };
            print(&engine.list_for_actor(&actor, filter).await)
        }
        Commands::Show { id } => print(&engine.get_detail(&id, &actor).await),
        Commands::Bind { id, external_id } => {
            print(&engine.bind_external_task_id(&id, &external_id, &actor).await)
        }
        Commands::Delete { id } => print(&engine.soft_delete(&id, &actor).await),
        Commands::AddUser { id, name, roles } => {
            let roles = roles
                .iter()
                .map(|role| serde_json::from_value(Value::String(role.trim().to_ascii_uppercase())))
                .collect::<Result<Vec<Role>, _>>()
                .context("parsing roles")?;
            let user = UserRecord { id, name, roles };
            store.put_user(&user)?;
            print(&Envelope::ok(user, crate::utils::new_trace_id()))
        }
    }
}

fn print<T: Serialize>(envelope: &Envelope<T>) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(envelope.success)
}

/// Inline JSON, or stdin for `-`
fn read_json(arg: &str) -> anyhow::Result<Value> {
    let raw = if arg == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        arg.to_string()
    };
    serde_json::from_str(&raw).context("input is not valid JSON")
}
