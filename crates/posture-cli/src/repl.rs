//! REPL – Read-Eval-Print Loop for the posture shell.
//!
//! Input lines are either a request or a slash-command:
//!   <target> <posture> [timescale] – dispatch (`all`, a group, or `a,b,c`)
//!   /wait                          – block until every motion has finished
//!   /status                        – completion state and last batch outcome
//!   /postures [group]              – list known postures
//!   /settle <posture|->            – set or clear the settle posture
//!   /help                          – show this list
//!   /quit | /exit                  – exit the shell

use colored::Colorize;
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use posture_runtime::Dispatcher;
use posture_types::{DispatchEvent, DispatchPayload, Request};
use tokio::runtime::Runtime;
use tokio::sync::broadcast;

use crate::cli::settle_from_arg;

/// How often a blocking `/wait` checks the shutdown flag.
const INTERRUPT_CHECK: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Execute(Request),
    Wait,
    Status,
    Postures(Option<String>),
    /// `None` clears the settle posture.
    Settle(Option<String>),
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if !line.starts_with('/') {
            return Request::parse(line)
                .map(Command::Execute)
                .map_err(|e| e.to_string());
        }

        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        match name {
            "/wait" => Ok(Command::Wait),
            "/status" => Ok(Command::Status),
            "/postures" => Ok(Command::Postures(arg.map(str::to_string))),
            "/settle" => match arg.map(settle_from_arg) {
                Some(posture) if posture.is_empty() => Ok(Command::Settle(None)),
                Some(posture) => Ok(Command::Settle(Some(posture))),
                None => Err("usage: /settle <posture|->".to_string()),
            },
            "/help" => Ok(Command::Help),
            "/quit" | "/exit" => Ok(Command::Quit),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Whether the loop keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a [`Dispatcher`] from blocking terminal input.
pub struct Shell<'rt> {
    rt: &'rt Runtime,
    dispatcher: Dispatcher,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<'rt> Shell<'rt> {
    pub fn new(
        rt: &'rt Runtime,
        dispatcher: Dispatcher,
        poll: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rt,
            dispatcher,
            poll,
            shutdown,
        }
    }

    /// Read and handle lines until `/quit`, EOF, or the shutdown flag.
    pub fn run(&self) {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            print!("{} ", "posture>".bold().cyan());
            stdout.flush().ok();

            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            }

            if line.trim().is_empty() {
                continue;
            }
            match Command::parse(&line) {
                Ok(cmd) => {
                    if self.handle(cmd) == Flow::Quit {
                        println!("{}", "Goodbye.".green());
                        self.shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                Err(e) => println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    e,
                    "/help".bold()
                ),
            }
        }
    }

    /// Dispatch one request and wait for it.  Returns `true` when every goal
    /// was sent and the motion finished.
    pub fn run_once(&self, line: &str) -> bool {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                println!("{} {}", "Error:".red(), e);
                return false;
            }
        };
        let sent = self.execute(request);
        self.wait() && sent
    }

    pub fn handle(&self, cmd: Command) -> Flow {
        match cmd {
            Command::Execute(request) => {
                self.execute(request);
            }
            Command::Wait => {
                self.wait();
            }
            Command::Status => self.status(),
            Command::Postures(group) => {
                print_postures(&self.dispatcher.list_postures(group.as_deref()));
            }
            Command::Settle(posture) => self.settle(posture),
            Command::Help => cmd_help(),
            Command::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    // -------------------------------------------------------------------------
    // Command handlers
    // -------------------------------------------------------------------------

    fn execute(&self, request: Request) -> bool {
        let Request {
            target,
            posture,
            timescale,
        } = request;
        let label = format!("{target} {posture}");
        let sent = self
            .rt
            .block_on(self.dispatcher.execute(target, &posture, timescale));
        if sent {
            println!("  {} {}", "→ sent".green(), label.bold());
        } else {
            println!(
                "  {} {} (see log for the failing groups)",
                "✗ not every goal was sent:".red(),
                label.bold()
            );
        }
        sent
    }

    /// Block until everything is done.  Returns `false` when interrupted.
    fn wait(&self) -> bool {
        let finished = self.rt.block_on(async {
            loop {
                match self
                    .dispatcher
                    .wait_until_done(self.poll, Some(INTERRUPT_CHECK))
                    .await
                {
                    Ok(()) => return true,
                    Err(_) if self.shutdown.load(Ordering::SeqCst) => return false,
                    Err(_) => {}
                }
            }
        });
        if finished {
            let failed = self.rt.block_on(self.dispatcher.has_failed());
            if failed {
                println!("  {}", "done, with failed goals".yellow());
            } else {
                println!("  {}", "done".green());
            }
        } else {
            println!("  {}", "wait interrupted".yellow());
        }
        finished
    }

    fn status(&self) {
        let (all_done, failed, pending, connected, chain, outcome) = self.rt.block_on(async {
            (
                self.dispatcher.is_all_done().await,
                self.dispatcher.has_failed().await,
                self.dispatcher.pending_groups().await,
                self.dispatcher.connected_groups().await,
                self.dispatcher.chain_policy().await,
                self.dispatcher.last_outcome().await,
            )
        });

        println!("{}", "Status".bold().underline());
        let state = if all_done { "idle".green() } else { "moving".yellow() };
        println!("  State      : {state} ({pending} group(s) pending)");
        let failure = if failed { "yes".red() } else { "no".green() };
        println!("  Failed     : {failure}");
        let settle = if chain.settle_posture.is_empty() {
            "<none>".dimmed()
        } else {
            chain.settle_posture.as_str().bold()
        };
        println!(
            "  Settle     : {settle} (on failure: {})",
            chain.chain_on_failure
        );
        println!("  Connected  : {}", connected.join(", "));
        match outcome.map(|o| serde_json::to_string_pretty(&o)) {
            Some(Ok(json)) => println!("  Last batch :\n{json}"),
            Some(Err(e)) => println!("  Last batch : {}", e.to_string().red()),
            None => println!("  Last batch : {}", "<none>".dimmed()),
        }
    }

    fn settle(&self, posture: Option<String>) {
        self.rt.block_on(async {
            let mut policy = self.dispatcher.chain_policy().await;
            policy.settle_posture = posture.clone().unwrap_or_default();
            self.dispatcher.set_chain_policy(policy).await;
        });
        match posture {
            Some(p) => println!("  {} {}", "✓ settle posture set to".green(), p.bold()),
            None => println!("  {}", "✓ settle posture cleared".green()),
        }
    }
}

const COMMANDS: &[(&str, &str)] = &[
    (
        "<target> <posture> [timescale]",
        "dispatch, e.g. `all rest` or `left_arm,right_arm wave 2`",
    ),
    ("/wait", "block until every motion has finished"),
    ("/status", "completion state and last batch outcome"),
    ("/postures [group]", "list known postures"),
    ("/settle <posture|->", "set or clear the settle posture"),
    ("/quit  /exit", "exit the shell"),
];

fn cmd_help() {
    println!();
    println!("{}", "Posture Commands".bold().underline());
    for (usage, what) in COMMANDS {
        println!("  {} – {}", format!("{usage:<30}").bold().cyan(), what);
    }
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Output helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn print_postures(postures: &BTreeMap<String, Vec<String>>) {
    if postures.is_empty() {
        println!("  {}", "no postures loaded".dimmed());
        return;
    }
    for (group, names) in postures {
        println!("  {:<12} {}", group.bold(), names.join(", "));
    }
}

/// Print batch-level events as they happen.  Runs until the bus closes.
pub async fn print_events(mut rx: broadcast::Receiver<DispatchEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match event.payload {
                DispatchPayload::BatchCompleted(outcome) if outcome.is_success() => {
                    println!("\n  {} {}", "✓ finished".green(), outcome.posture.bold());
                }
                DispatchPayload::BatchCompleted(outcome) => {
                    println!(
                        "\n  {} {} (failed: {})",
                        "✗ finished with errors".red(),
                        outcome.posture.bold(),
                        outcome.failed.join(", ")
                    );
                }
                DispatchPayload::ChainTriggered { settle_posture, .. } => {
                    println!("  {} {}", "↪ settling into".cyan(), settle_posture.bold());
                }
                _ => {}
            },
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
