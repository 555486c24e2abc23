//! Command parsing and dispatch.
//!
//! One command language serves both the interactive REPL and single-shot
//! argument mode. Statements (`insert`, `delete`, `select`, `range`,
//! `lookup`) operate on rows; dot-commands inspect the engine.

use anyhow::Result;
use forge_common::ForgeError;
use forge_storage::{Database, Row};

use crate::formatter;

/// What the loop should do after a command ran.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Keep reading input.
    Continue,
    /// Leave the REPL.
    Exit,
}

/// A parsed command.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// `insert <id> <username> <email>`
    Insert { id: u32, username: String, email: String },
    /// `delete <id>`
    Delete(u32),
    /// `select`
    Select,
    /// `range <lo> <hi>`
    Range(u32, u32),
    /// `lookup <id>`
    Lookup(u32),
    /// `.tree`
    Tree,
    /// `.json`
    Json,
    /// `.stats`
    Stats,
    /// `.pool`
    Pool,
    /// `.freelist`
    FreeList,
    /// `.bloom`
    Bloom,
    /// `.bloom rebuild`
    BloomRebuild,
    /// `.free <n>`
    Free(u32),
    /// `help`
    Help,
    /// `exit`
    Exit,
    /// Anything with a recognised verb but bad arguments.
    Usage(&'static str),
    /// Anything else.
    Unknown,
}

impl Command {
    /// Parses one line of input.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let mut parts = input.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        match verb {
            "insert" => match args.as_slice() {
                [id, username, email] => match id.parse() {
                    Ok(id) => Command::Insert {
                        id,
                        username: (*username).to_string(),
                        email: (*email).to_string(),
                    },
                    Err(_) => Command::Usage("Usage: insert <id> <username> <email>"),
                },
                _ => Command::Usage("Usage: insert <id> <username> <email>"),
            },
            "delete" => match args.as_slice() {
                [id] => match id.parse() {
                    Ok(id) => Command::Delete(id),
                    Err(_) => Command::Usage("Usage: delete <id>"),
                },
                _ => Command::Usage("Usage: delete <id>"),
            },
            "select" if args.is_empty() => Command::Select,
            "range" => match args.as_slice() {
                [lo, hi] => match (lo.parse(), hi.parse()) {
                    (Ok(lo), Ok(hi)) => Command::Range(lo, hi),
                    _ => Command::Usage("Usage: range <start_id> <end_id>"),
                },
                _ => Command::Usage("Usage: range <start_id> <end_id>"),
            },
            "lookup" => match args.as_slice() {
                [id] => match id.parse() {
                    Ok(id) => Command::Lookup(id),
                    Err(_) => Command::Usage("Usage: lookup <id>"),
                },
                _ => Command::Usage("Usage: lookup <id>"),
            },
            ".tree" if args.is_empty() => Command::Tree,
            ".json" if args.is_empty() => Command::Json,
            ".stats" if args.is_empty() => Command::Stats,
            ".pool" if args.is_empty() => Command::Pool,
            ".freelist" if args.is_empty() => Command::FreeList,
            ".bloom" => match args.as_slice() {
                [] => Command::Bloom,
                ["rebuild"] => Command::BloomRebuild,
                _ => Command::Usage("Usage: .bloom [rebuild]"),
            },
            ".free" => match args.as_slice() {
                [page] => match page.parse() {
                    Ok(page) if page > 1 => Command::Free(page),
                    _ => Command::Usage("Usage: .free <page_num>  (page must be > 1)"),
                },
                _ => Command::Usage("Usage: .free <page_num>  (page must be > 1)"),
            },
            "help" | ".help" => Command::Help,
            "exit" | "quit" => Command::Exit,
            _ => Command::Unknown,
        }
    }

    /// Runs the command against the database, printing its output.
    ///
    /// User-level rejections (duplicate key, not found) are printed and
    /// the loop continues; fatal engine errors propagate to the caller.
    pub fn execute(&self, db: &mut Database) -> Result<CommandOutcome> {
        match self {
            Command::Insert { id, username, email } => {
                report(db.insert(Row::new(*id, username.clone(), email.clone())), || {
                    "Executed.".to_string()
                })?;
            }

            Command::Delete(id) => {
                report(db.remove(*id), || format!("Deleted key {id}."))?;
            }

            Command::Select => {
                let rows: Result<Vec<Row>, ForgeError> = db.all()?.collect();
                for row in rows? {
                    println!("{}", formatter::format_row(&row));
                }
            }

            Command::Range(lo, hi) => {
                let rows: Result<Vec<Row>, ForgeError> = db.range(*lo, *hi)?.collect();
                for row in rows? {
                    println!("{}", formatter::format_row(&row));
                }
            }

            Command::Lookup(id) => match db.find(*id)? {
                Some(row) => println!("Found: ({}, {}, {})", row.id, row.username, row.email),
                None => println!("Error: key {id} not found."),
            },

            Command::Tree => print!("{}", db.tree_dump()?),
            Command::Json => print!("{}", db.json_dump()?),
            Command::Stats => println!("{}", formatter::format_db_stats(&db.stats())),
            Command::Pool => println!("{}", formatter::format_pool_stats(&db.pool_stats())),
            Command::FreeList => {
                let list = db.free_list()?;
                println!("{}", formatter::format_free_list(&list));
            }
            Command::Bloom => println!("{}", formatter::format_bloom_stats(&db.bloom_stats()?)),
            Command::BloomRebuild => {
                db.rebuild_bloom()?;
                println!("Bloom filter rebuilt from leaf scan.");
            }
            Command::Free(page) => {
                report(db.free_page(*page), || format!("Freed page {page}."))?;
            }

            Command::Help => println!("{}", help_text()),
            Command::Exit => return Ok(CommandOutcome::Exit),
            Command::Usage(usage) => println!("{usage}"),
            Command::Unknown => println!("Unrecognized command. Type 'help' for usage."),
        }
        Ok(CommandOutcome::Continue)
    }
}

/// Prints the success message, or the error when it is a user-level
/// rejection. Fatal errors propagate.
fn report(result: Result<(), ForgeError>, success: impl FnOnce() -> String) -> Result<()> {
    match result {
        Ok(()) => {
            println!("{}", success());
            Ok(())
        }
        Err(err) if err.is_fatal() || matches!(err, ForgeError::Io { .. }) => Err(err.into()),
        Err(err) => {
            println!("Error: {err}.");
            Ok(())
        }
    }
}

fn help_text() -> &'static str {
    "ForgeDB commands
================

Rows:
  insert <id> <username> <email>   Insert a row
  delete <id>                      Delete a row by id
  select                           Print every row in key order
  range <lo> <hi>                  Print rows with lo <= id <= hi
  lookup <id>                      Point lookup by id

Diagnostics:
  .tree             Print the tree structure
  .json             Print the tree as JSON
  .stats            Database header statistics
  .pool             Buffer pool statistics
  .freelist         Walk the free page list
  .bloom            Bloom filter statistics
  .bloom rebuild    Rebuild the bloom filter from the tree
  .free <n>         Put page n on the free list (n > 1)

Other:
  help              Show this help
  exit              Quit"
}
