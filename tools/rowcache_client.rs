use std::error::Error;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rowcache::service::{Client, TableDescription};
use rowcache::Status;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Parser, Debug)]
#[command(name = "rowcache-client", about = "Query a rowcache server")]
struct Args {
    /// Server TCP address
    #[arg(long, default_value = "127.0.0.1:7070")]
    addr: SocketAddr,
    /// Connect to a Unix socket instead of TCP
    #[arg(long)]
    unix: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look one key up and print the stored row
    Get {
        /// Table name or id
        table: String,
        /// Indexed column name or index id
        index: String,
        /// Key; parsed as an integer for int indexes
        key: String,
    },
    /// Print the statistics of one table
    Stats {
        /// Table name or id
        table: String,
    },
    /// Print the schema of every table
    Describe,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let result = match &args.unix {
        #[cfg(unix)]
        Some(path) => match Client::connect_unix(path).await {
            Ok(client) => run(client, args.command).await,
            Err(err) => Err(err.into()),
        },
        #[cfg(not(unix))]
        Some(_) => Err("unix sockets are not supported on this platform".into()),
        None => match Client::connect(args.addr).await {
            Ok(client) => run(client, args.command).await,
            Err(err) => Err(err.into()),
        },
    };

    match result {
        Ok(Status::Ok) => ExitCode::SUCCESS,
        Ok(status) => {
            eprintln!("{status}");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run<S>(mut client: Client<S>, command: Command) -> Result<Status, Box<dyn Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let status = match command {
        Command::Get { table, index, key } => {
            let tables = client.describe().await?;
            let (table_id, index_id, is_int) = resolve(&tables, &table, &index)?;
            let response = if is_int {
                let key: i64 = key.parse().map_err(|_| format!("{key:?} is not an integer key"))?;
                client.fetch_int(table_id, index_id, key).await?
            } else {
                client.fetch(table_id, index_id, key.as_bytes()).await?
            };
            if response.is_ok() {
                let mut stdout = io::stdout().lock();
                stdout.write_all(&response.payload)?;
                writeln!(stdout)?;
            }
            response.status
        }
        Command::Stats { table } => {
            let tables = client.describe().await?;
            let table_id = resolve_table(&tables, &table)?.id;
            match client.stats(table_id).await? {
                Some(stats) => {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                    Status::Ok
                }
                None => Status::UnknownTable,
            }
        }
        Command::Describe => {
            let tables = client.describe().await?;
            println!("{}", serde_json::to_string_pretty(&tables)?);
            Status::Ok
        }
    };
    client.quit().await?;
    Ok(status)
}

fn resolve_table<'a>(tables: &'a [TableDescription], table: &str) -> Result<&'a TableDescription, String> {
    tables
        .iter()
        .find(|t| t.name == table || t.id.to_string() == table)
        .ok_or_else(|| format!("no table {table:?}"))
}

fn resolve(tables: &[TableDescription], table: &str, index: &str) -> Result<(u8, u8, bool), String> {
    let table = resolve_table(tables, table)?;
    let index = table
        .indexes
        .iter()
        .find(|i| i.column == index || i.id.to_string() == index)
        .ok_or_else(|| format!("table {:?} has no index {index:?}", table.name))?;
    Ok((table.id, index.id, index.key_type == "int"))
}
