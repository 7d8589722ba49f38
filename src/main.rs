//! Bank Ledger operator CLI
//!
//! ```text
//! bank_ledger [--env dev] transfer <from> <to> <amount>
//! bank_ledger [--env dev] account <id>
//! ```
//!
//! Runs against the PostgreSQL database named in `config/<env>.yaml`
//! (or `DATABASE_URL`). Results are printed as JSON.

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;

use bank_ledger::config::AppConfig;
use bank_ledger::db::Database;
use bank_ledger::store::{PgStore, Querier, Store, TransferTxParams, with_deadline};

enum Command {
    Transfer(TransferTxParams),
    Account(i64),
}

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn parse_id(arg: Option<&String>, name: &str) -> anyhow::Result<i64> {
    let raw = arg.with_context(|| format!("missing <{}>", name))?;
    raw.parse()
        .with_context(|| format!("<{}> must be an integer, got {:?}", name, raw))
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    // Positional arguments, with `--env <name>` removed
    let mut positional = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--env" || args[i] == "-e" {
            i += 2;
            continue;
        }
        positional.push(&args[i]);
        i += 1;
    }

    match positional.first().map(|s| s.as_str()) {
        Some("transfer") => {
            let from_account_id = parse_id(positional.get(1).copied(), "from")?;
            let to_account_id = parse_id(positional.get(2).copied(), "to")?;
            let amount = parse_id(positional.get(3).copied(), "amount")?;
            if amount <= 0 {
                bail!("<amount> must be positive");
            }
            if from_account_id == to_account_id {
                bail!("<from> and <to> must differ");
            }
            Ok(Command::Transfer(TransferTxParams {
                from_account_id,
                to_account_id,
                amount,
            }))
        }
        Some("account") => Ok(Command::Account(parse_id(positional.get(1).copied(), "id")?)),
        Some(other) => bail!("unknown command {:?}", other),
        None => bail!("usage: bank_ledger [--env dev] transfer <from> <to> <amount> | account <id>"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let env = get_env(&args);
    let command = parse_command(&args)?;

    let app_config = AppConfig::load(&env)?;
    let _log_guard = bank_ledger::logging::init_logging(&app_config);
    tracing::info!("Starting bank ledger in {} mode", env);

    let db = Database::connect(app_config.postgres_url()?, &app_config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await.context("PostgreSQL health check failed")?;
    let store = PgStore::new(db.pool().clone());

    let root = CancellationToken::new();
    let cancel = match app_config.database.tx_timeout() {
        Some(timeout) => with_deadline(&root, timeout),
        None => root.child_token(),
    };

    // Ctrl-C cancels whatever transaction is in flight
    let on_signal = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match command {
        Command::Transfer(arg) => {
            let result = store.transfer_tx(&cancel, arg).await.map_err(|e| {
                tracing::error!(code = e.code(), error = %e, "Transfer failed");
                e
            })?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Account(id) => {
            let account = store.get_account(id).await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
    }
    Ok(())
}
