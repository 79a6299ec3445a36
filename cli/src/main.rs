//! Khatm CLI client - manage reading circles from the terminal

mod client;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use khatm::circle::{BatchOutcome, CompletionOutcome, LeaveOutcome};
use khatm::identity::{FileIdentity, IdentityResolver};
use khatm::models::{Assignment, CircleMembership, CircleOverview, MemberSummary};
use khatm::websocket::ClientMessage;

use crate::client::KhatmClient;

#[derive(Parser)]
#[command(name = "khatm")]
#[command(about = "CLI client for khatm reading circles")]
#[command(version)]
struct Cli {
    /// Server URL (default: ws://localhost:3000/ws)
    #[arg(short, long, env = "KHATM_SERVER", default_value = "ws://localhost:3000/ws")]
    server: String,

    /// File holding this device's id
    #[arg(long, env = "KHATM_IDENTITY")]
    identity: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a circle and become its organizer
    Create {
        /// Circle name
        name: String,

        /// Your nickname in the circle
        #[arg(short = 'n', long)]
        nickname: String,

        /// Days until the circle expires
        #[arg(short, long, default_value_t = 30)]
        days: i64,
    },

    /// Join a circle with an invite code
    Join {
        code: String,

        #[arg(short = 'n', long)]
        nickname: String,
    },

    /// Leave your circle (deletes it if you are the organizer)
    Leave,

    /// Show your circle and its progress
    Status,

    /// List members of your circle
    Members,

    /// List every unit of your circle
    Assignments,

    /// List the units assigned to you
    Mine,

    /// Assign units to a member
    Assign {
        /// Member id, see `members`
        member: Uuid,

        #[arg(required = true)]
        units: Vec<u8>,
    },

    /// Free units
    Unassign {
        #[arg(required = true)]
        units: Vec<u8>,
    },

    /// Mark one of your units as being read
    Start { unit: u8 },

    /// Mark one of your units as finished
    Complete { unit: u8 },

    /// Delete expired circles
    Cleanup,

    /// Delete a circle outright
    Delete { circle: Uuid },

    /// Generate an unused invite code
    Code,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "khatm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let identity = match &cli.identity {
        Some(path) => FileIdentity::new(path),
        None => FileIdentity::default(),
    };
    let device_id = identity
        .resolve_device_id()
        .with_context(|| format!("failed to read device id from {}", identity.path().display()))?;

    let mut client = KhatmClient::connect(&cli.server).await?;

    match cli.command {
        Commands::Create {
            name,
            nickname,
            days,
        } => run_create(&mut client, &device_id, name, nickname, days).await,
        Commands::Join { code, nickname } => {
            run_join(&mut client, &device_id, code, nickname).await
        }
        Commands::Leave => run_leave(&mut client, &device_id).await,
        Commands::Status => run_status(&mut client, &device_id).await,
        Commands::Members => run_members(&mut client, &device_id).await,
        Commands::Assignments => run_assignments(&mut client, &device_id, false).await,
        Commands::Mine => run_assignments(&mut client, &device_id, true).await,
        Commands::Assign { member, units } => {
            run_assign(&mut client, &device_id, Some(member), units).await
        }
        Commands::Unassign { units } => run_assign(&mut client, &device_id, None, units).await,
        Commands::Start { unit } => run_start(&mut client, &device_id, unit).await,
        Commands::Complete { unit } => run_complete(&mut client, &device_id, unit).await,
        Commands::Cleanup => {
            let cleaned: usize = client.call(ClientMessage::CleanupExpired).await?;
            println!("Removed {} expired circle(s).", cleaned);
            Ok(())
        }
        Commands::Delete { circle } => {
            let () = client
                .call(ClientMessage::DeleteCircle { circle_id: circle })
                .await?;
            println!("Circle {} deleted.", circle);
            Ok(())
        }
        Commands::Code => {
            let code: String = client.call(ClientMessage::GenerateCode).await?;
            println!("{}", code);
            Ok(())
        }
    }
}

/// The caller's active circle, or an error telling them to join one
async fn current_circle(client: &mut KhatmClient, device_id: &str) -> Result<CircleMembership> {
    let found: Option<CircleMembership> = client
        .call(ClientMessage::CheckUserCircle {
            device_id: device_id.to_string(),
        })
        .await?;
    found.context("You are not in a circle. Use `khatm create` or `khatm join`.")
}

/// Deadline `days` from now, rejecting values chrono cannot represent
fn expiry_in(days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .with_context(|| format!("{} days is out of range", days))
}

async fn run_create(
    client: &mut KhatmClient,
    device_id: &str,
    name: String,
    nickname: String,
    days: i64,
) -> Result<()> {
    let created: CircleMembership = client
        .call(ClientMessage::CreateCircle {
            name,
            organizer_nickname: nickname,
            expires_at: expiry_in(days)?,
            device_id: device_id.to_string(),
        })
        .await?;

    println!("Created circle \"{}\"", created.circle.name);
    println!("Invite code: {}", created.circle.code);
    println!(
        "Expires: {}",
        created.circle.expires_at.format("%Y-%m-%d %H:%M")
    );
    Ok(())
}

async fn run_join(client: &mut KhatmClient, device_id: &str, code: String, nickname: String) -> Result<()> {
    let joined: CircleMembership = client
        .call(ClientMessage::JoinCircle {
            code,
            nickname,
            device_id: device_id.to_string(),
        })
        .await?;
    println!(
        "Joined \"{}\" as {}",
        joined.circle.name, joined.membership.nickname
    );
    Ok(())
}

async fn run_leave(client: &mut KhatmClient, device_id: &str) -> Result<()> {
    let current = current_circle(client, device_id).await?;
    let outcome: LeaveOutcome = client
        .call(ClientMessage::LeaveCircle {
            circle_id: current.circle.id,
            device_id: device_id.to_string(),
        })
        .await?;

    if outcome.circle_deleted {
        println!("You were the organizer; \"{}\" has been deleted.", current.circle.name);
    } else {
        println!("Left \"{}\".", current.circle.name);
    }
    Ok(())
}

async fn run_status(client: &mut KhatmClient, device_id: &str) -> Result<()> {
    let current = current_circle(client, device_id).await?;
    let overview: CircleOverview = client
        .call(ClientMessage::GetCircle {
            circle_id: current.circle.id,
        })
        .await?;

    let circle = &overview.circle;
    println!("{} ({})", circle.name, circle.code);
    println!("{:─<40}", "");
    println!("  Status:    {}", circle.status.as_str());
    println!(
        "  Progress:  {}/{} ({}%)",
        overview.progress.completed, overview.progress.total, overview.progress.percentage
    );
    println!("  Expires:   {}", circle.expires_at.format("%Y-%m-%d %H:%M"));
    println!("  You:       {}", current.membership.nickname);
    Ok(())
}

async fn run_members(client: &mut KhatmClient, device_id: &str) -> Result<()> {
    let current = current_circle(client, device_id).await?;
    let members: Vec<MemberSummary> = client
        .call(ClientMessage::GetMembers {
            circle_id: current.circle.id,
        })
        .await?;

    println!("Members of {}:", current.circle.name);
    println!("{:─<60}", "");
    for summary in members {
        let role = if summary.member.is_organizer { " (organizer)" } else { "" };
        println!(
            "  {} {}{} - {} assigned, {} completed",
            summary.member.id,
            summary.member.nickname,
            role,
            summary.assigned_units,
            summary.completed_units
        );
    }
    Ok(())
}

async fn run_assignments(client: &mut KhatmClient, device_id: &str, mine: bool) -> Result<()> {
    let current = current_circle(client, device_id).await?;
    let circle_id = current.circle.id;
    let assignments: Vec<Assignment> = if mine {
        client
            .call(ClientMessage::GetMyAssignments {
                circle_id,
                device_id: device_id.to_string(),
            })
            .await?
    } else {
        client.call(ClientMessage::GetAssignments { circle_id }).await?
    };

    if assignments.is_empty() {
        println!("No units assigned.");
        return Ok(());
    }
    for assignment in assignments {
        let holder = assignment
            .member_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>2}  {:<12} {}",
            assignment.unit_number,
            assignment.status.as_str(),
            holder
        );
    }
    Ok(())
}

async fn run_assign(
    client: &mut KhatmClient,
    device_id: &str,
    member: Option<Uuid>,
    units: Vec<u8>,
) -> Result<()> {
    let current = current_circle(client, device_id).await?;
    let circle_id = current.circle.id;
    let message = match member {
        Some(member_id) => ClientMessage::AssignUnits {
            circle_id,
            unit_numbers: units,
            member_id,
        },
        None => ClientMessage::UnassignUnits {
            circle_id,
            unit_numbers: units,
        },
    };

    // Partial batches still carry the tally
    let response = client.request(message).await?;
    let error = response.error.clone();
    match response.data {
        Some(data) => print_batch(&serde_json::from_value(data)?),
        None => anyhow::bail!(error.unwrap_or_else(|| "Request failed".to_string())),
    }
    Ok(())
}

fn print_batch(outcome: &BatchOutcome) {
    if !outcome.succeeded.is_empty() {
        println!("Saved units: {:?}", outcome.succeeded);
    }
    for failure in &outcome.failed {
        println!("Unit {}: {}", failure.unit_number, failure.error);
    }
}

async fn run_start(client: &mut KhatmClient, device_id: &str, unit: u8) -> Result<()> {
    let current = current_circle(client, device_id).await?;
    let assignment: Assignment = client
        .call(ClientMessage::MarkInProgress {
            circle_id: current.circle.id,
            unit_number: unit,
            device_id: device_id.to_string(),
        })
        .await?;
    println!("Unit {} is now {}.", assignment.unit_number, assignment.status.as_str());
    Ok(())
}

async fn run_complete(client: &mut KhatmClient, device_id: &str, unit: u8) -> Result<()> {
    let current = current_circle(client, device_id).await?;
    let outcome: CompletionOutcome = client
        .call(ClientMessage::MarkCompleted {
            circle_id: current.circle.id,
            unit_number: unit,
            device_id: device_id.to_string(),
        })
        .await?;

    println!(
        "Unit {} completed. Circle progress: {}/{} ({}%)",
        outcome.assignment.unit_number,
        outcome.progress.completed,
        outcome.progress.total,
        outcome.progress.percentage
    );
    if outcome.circle_completed {
        println!("The circle has finished every unit!");
    }
    Ok(())
}
