use std::{fmt::Write as _, io::Write as _, path::Path, str::FromStr, time::Duration};

use tokio::{
    fs::File,
    io::{self, AsyncBufRead, AsyncBufReadExt, BufReader},
};
use tracing::{info, warn};

use crate::{
    common::{Error, Result},
    network::{GroupConnection, Node},
    replica::{History, Mailbox, MembershipSnapshot, TxKind},
};

/// Operator commands, one per line.
#[derive(Clone, PartialEq, Debug)]
pub enum Command {
    Balance,
    Deposit(f64),
    AddInterest(f64),
    GetHistory,
    CleanHistory,
    MemberInfo,
    Sleep(Duration),
    Exit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let number = |field: Option<&&str>, what: &str| -> Result<f64> {
            match field.map(|f| f.parse::<f64>()) {
                Some(Ok(value)) if value.is_finite() => Ok(value),
                _ => Err(Error::Command(format!("2nd argument: {what} needs to be a number."))),
            }
        };
        match fields.first().copied() {
            Some("balance") => Ok(Command::Balance),
            Some("deposit") => Ok(Command::Deposit(number(fields.get(1), "amount to deposit")?)),
            Some("addInterest") => {
                Ok(Command::AddInterest(number(fields.get(1), "interest rate")?))
            }
            Some("getHistory") => Ok(Command::GetHistory),
            Some("cleanHistory") => Ok(Command::CleanHistory),
            Some("memberInfo") => Ok(Command::MemberInfo),
            Some("sleep") => {
                let seconds = number(fields.get(1), "duration in seconds")?;
                Duration::try_from_secs_f64(seconds)
                    .map(Command::Sleep)
                    .map_err(|_| Error::Command("sleep needs a non-negative duration".into()))
            }
            Some("exit") => Ok(Command::Exit),
            Some(other) => Err(Error::Command(format!("Unknown command {other}"))),
            None => Err(Error::Command("Unknown command".into())),
        }
    }
}

pub enum Outcome {
    Output(String),
    Exit,
}

pub fn menu(group: &str) -> String {
    format!(
        "\n==========\nAccount Replica [{group}] Menu:\n==========\n\n\
         \tbalance -- print account balance\n\
         \tdeposit <amount> -- deposit to account\n\
         \taddInterest <percent> -- adds interest to balance\n\n\
         \tgetHistory -- print recent transactions\n\
         \tcleanHistory -- empty history list\n\
         \tmemberInfo -- print current participating replicas\n\
         \tsleep <seconds> -- pause the command stream\n\n\
         \texit -- quit\n"
    )
}

pub fn format_balance(balance: f64) -> String {
    format!("{balance:.2}")
}

pub fn format_history(history: &History) -> String {
    let mut out = String::new();
    for (i, tx) in history.executed.iter().enumerate() {
        let _ = writeln!(out, "{}. {tx}", i + 1);
    }
    out.push('\n');
    for tx in &history.pending {
        let _ = writeln!(out, "{tx} (pending)");
    }
    out
}

pub fn format_members(snapshot: &MembershipSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Group {} view {} with {} members (minimum {}, quorum {}):",
        snapshot.group,
        snapshot.view_id,
        snapshot.members.len(),
        snapshot.minimum,
        if snapshot.latched { "reached" } else { "pending" },
    );
    for member in &snapshot.members {
        let _ = writeln!(out, "\t{member}");
    }
    if !snapshot.partitions.is_empty() {
        let _ = writeln!(out, "Last network change:");
        for (i, set) in snapshot.partitions.iter().enumerate() {
            let marker = if set.local { "(LOCAL)" } else { "(OTHER)" };
            let members: Vec<&str> = set.members.iter().map(|m| m.as_str()).collect();
            let _ = writeln!(out, "\t{marker} Virtual Synchrony Set {i}: {}", members.join(" "));
        }
    }
    out
}

pub async fn execute(mailbox: &Mailbox, command: Command) -> Result<Outcome> {
    let output = match command {
        Command::Balance => format_balance(mailbox.balance().await?),
        Command::Deposit(amount) => {
            let tx = mailbox.submit(TxKind::Deposit, amount).await?;
            info!(id = %tx.unique_id, "deposit queued");
            String::new()
        }
        Command::AddInterest(percent) => {
            let tx = mailbox.submit(TxKind::AddInterest, percent).await?;
            info!(id = %tx.unique_id, "interest queued");
            String::new()
        }
        Command::GetHistory => format_history(&mailbox.history().await?),
        Command::CleanHistory => {
            mailbox.clean_history().await?;
            String::new()
        }
        Command::MemberInfo => format_members(&mailbox.membership().await?),
        Command::Sleep(duration) => {
            tokio::time::sleep(duration).await;
            String::new()
        }
        Command::Exit => return Ok(Outcome::Exit),
    };
    Ok(Outcome::Output(output))
}

/// Run commands from `input` (or stdin) until `exit` or end of input,
/// then leave the group.
pub async fn run<C: GroupConnection>(node: Node<C>, input: Option<&Path>) -> Result<()> {
    let interactive = input.is_none();
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(File::open(path).await?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let mut lines = reader.lines();
    let mailbox = node.mailbox();
    let group = node.config().account.clone();

    println!("{}", menu(&group));
    loop {
        if interactive {
            print!("\nUser> ");
            let _ = std::io::stdout().flush();
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                if e.to_string().starts_with("Unknown command") {
                    println!("{}", menu(&group));
                }
                continue;
            }
        };
        match execute(&mailbox, command).await {
            Ok(Outcome::Output(output)) => {
                if !output.is_empty() {
                    println!("{output}");
                }
            }
            Ok(Outcome::Exit) => break,
            Err(Error::MailboxClosed) => return Err(Error::MailboxClosed),
            Err(e) => {
                warn!(error = %e, "command failed");
                eprintln!("{e}");
            }
        }
    }

    node.shutdown().await
}
