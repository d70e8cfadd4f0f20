use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use meshkv_server::client::{Connection, RemoteMap};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "meshkv-cli")]
#[command(about = "MeshKV CLI - command-line interface for a meshkv server", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short = 'p', long, default_value = "16400")]
    port: u16,

    /// Store to address
    #[arg(short = 's', long, default_value = "default")]
    store: String,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct MeshKvClient {
    map: RemoteMap,
    conn: Arc<Connection>,
}

impl MeshKvClient {
    async fn connect(args: &Args) -> Result<Self> {
        let addr = format!("{}:{}", args.host, args.port).parse()?;
        let conn = Connection::connect(addr).await?;
        Ok(Self {
            map: RemoteMap::new(Arc::clone(&conn), args.store.clone()),
            conn,
        })
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "GET" => self.cmd_get(args).await?,
            "SET" | "PUT" => self.cmd_set(args).await?,
            "SETNX" => self.cmd_setnx(args).await?,
            "DEL" | "DELETE" => self.cmd_del(args).await?,
            "EXISTS" => self.cmd_exists(args).await?,
            "KEYS" => self.cmd_keys().await?,
            "ENTRIES" => self.cmd_entries().await?,
            "DBSIZE" | "SIZE" => self.cmd_size().await?,
            "CLEAR" | "FLUSHDB" => self.cmd_clear().await?,
            "WATCH" => self.cmd_watch().await?,
            "PING" => self.cmd_ping().await?,
            "HELP" => help_text(),
            _ => return Err(anyhow::anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn cmd_get(&self, args: &[String]) -> Result<String> {
        let key = args.first().ok_or_else(|| anyhow::anyhow!("Usage: GET key"))?;
        match self.map.get(key).await? {
            Some(value) => Ok(String::from_utf8_lossy(&value).to_string()),
            None => Ok("(nil)".dimmed().to_string()),
        }
    }

    async fn cmd_set(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: SET key value"));
        }
        let previous = self.map.insert(&args[0], args[1].clone().into_bytes()).await?;
        Ok(match previous {
            Some(old) => format!(
                "{} (was {})",
                "OK".green(),
                String::from_utf8_lossy(&old)
            ),
            None => "OK".green().to_string(),
        })
    }

    async fn cmd_setnx(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            return Err(anyhow::anyhow!("Usage: SETNX key value"));
        }
        match self
            .map
            .insert_if_absent(&args[0], args[1].clone().into_bytes())
            .await?
        {
            None => Ok("OK".green().to_string()),
            Some(existing) => Ok(format!(
                "{} key already holds {}",
                "(unchanged)".yellow(),
                String::from_utf8_lossy(&existing)
            )),
        }
    }

    async fn cmd_del(&self, args: &[String]) -> Result<String> {
        let key = args.first().ok_or_else(|| anyhow::anyhow!("Usage: DEL key"))?;
        match self.map.remove(key).await? {
            Some(_) => Ok("1".to_string()),
            None => Ok("0".to_string()),
        }
    }

    async fn cmd_exists(&self, args: &[String]) -> Result<String> {
        let key = args
            .first()
            .ok_or_else(|| anyhow::anyhow!("Usage: EXISTS key"))?;
        Ok(if self.map.contains_key(key).await? {
            "1".to_string()
        } else {
            "0".to_string()
        })
    }

    async fn cmd_keys(&self) -> Result<String> {
        let keys = self.map.key_set().await?.collect().await?;
        if keys.is_empty() {
            return Ok("(empty)".dimmed().to_string());
        }
        Ok(keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{}) {}", i + 1, k))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_entries(&self) -> Result<String> {
        let entries = self.map.entry_set().await?.collect().await?;
        if entries.is_empty() {
            return Ok("(empty)".dimmed().to_string());
        }
        Ok(entries
            .iter()
            .map(|(k, v)| format!("{} = {}", k, String::from_utf8_lossy(v)))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_size(&self) -> Result<String> {
        Ok(self.map.len().await?.to_string())
    }

    async fn cmd_clear(&self) -> Result<String> {
        self.map.clear().await?;
        Ok("OK".green().to_string())
    }

    /// Stream change events until interrupted.
    async fn cmd_watch(&self) -> Result<String> {
        let mut subscription = self.map.subscribe(false).await?;
        println!(
            "{}",
            format!("Watching {} (ctrl-c to stop)...", self.map.store_name()).dimmed()
        );
        let interrupted = loop {
            tokio::select! {
                event = subscription.next() => match event {
                    Some(event) => println!(
                        "{}",
                        serde_json::to_string(&event).unwrap_or_else(|_| format!("{event:?}"))
                    ),
                    None => break false,
                },
                _ = tokio::signal::ctrl_c() => break true,
            }
        };
        if interrupted {
            subscription.unsubscribe().await?;
            return Ok("stopped".to_string());
        }
        Ok("subscription ended".to_string())
    }

    async fn cmd_ping(&self) -> Result<String> {
        self.conn.ping().await?;
        Ok("PONG".green().to_string())
    }
}

fn help_text() -> String {
    [
        "GET key            fetch a value",
        "SET key value      store a value, printing any previous one",
        "SETNX key value    store only if absent",
        "DEL key            remove a key",
        "EXISTS key         1 if present, 0 otherwise",
        "KEYS               list all keys",
        "ENTRIES            list all key-value pairs",
        "DBSIZE             number of entries",
        "CLEAR              remove every entry",
        "WATCH              stream change events",
        "PING               check the connection",
    ]
    .join("\n")
}

async fn interactive(client: MeshKvClient, store: &str) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    println!("{}", format!("meshkv-cli connected, store {store}").bold());
    println!("{}", "Type HELP for commands, ctrl-d to quit".dimmed());

    loop {
        match editor.readline(&format!("{store}> ")) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
                    break;
                }

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                match client.execute_command(&parts[0], &parts[1..]).await {
                    Ok(output) => println!("{output}"),
                    Err(e) => println!("{} {}", "error:".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let client = match MeshKvClient::connect(&args).await {
        Ok(client) => client,
        Err(e) => {
            error!("could not connect to {}:{}: {}", args.host, args.port, e);
            return Err(e);
        }
    };

    if args.command.is_empty() {
        interactive(client, &args.store).await
    } else {
        let output = client
            .execute_command(&args.command[0], &args.command[1..])
            .await?;
        println!("{output}");
        Ok(())
    }
}
