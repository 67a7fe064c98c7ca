use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, Settings},
    hosted_store::HostedStore,
    voice::{session_config, VoiceCoordinator, VoiceEvent, VoiceState},
    ClientEvent, DonorFilter, HemoClient,
};
use realtime_store::RealtimeStore;
use shared::domain::{BloodType, DonorId, DonorPatch, NewDonor, NewEmergency, Urgency};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voice_integration::{backends::PcmFileBackend, live_socket::LiveSocketConnector};

#[derive(Parser, Debug)]
#[command(name = "hemoflow", about = "Donor dashboard from the terminal")]
struct Cli {
    /// Overrides the configured local database.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists donors, newest first.
    List {
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long)]
        blood_type: Option<BloodType>,
    },
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        blood_type: BloodType,
        #[arg(long)]
        contact: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        last_donation: Option<NaiveDate>,
        #[arg(long)]
        unavailable: bool,
    },
    Update {
        id: DonorId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        blood_type: Option<BloodType>,
        #[arg(long)]
        contact: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        last_donation: Option<NaiveDate>,
    },
    Toggle {
        id: DonorId,
    },
    Notify {
        id: DonorId,
    },
    Delete {
        id: DonorId,
    },
    Inventory,
    Stats,
    /// Broadcasts an emergency request to every connected dashboard.
    Broadcast {
        #[arg(long)]
        blood_type: BloodType,
        #[arg(long)]
        hospital: String,
        #[arg(long)]
        units: u32,
        #[arg(long, default_value = "high")]
        urgency: Urgency,
    },
    /// Prints live changes until interrupted.
    Watch,
    /// Talks to the assistant using raw 16 kHz s16le input and writes the
    /// 24 kHz reply audio to `output`.
    Voice {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    let store = open_store(&settings).await?;
    let client = HemoClient::new(store);
    client
        .start()
        .await
        .context("failed to subscribe to donor changes")?;

    let result = run(&client, &settings, cli.command).await;
    client.stop().await;
    result
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn RealtimeStore>> {
    if let (true, Some(url), Some(key)) = (
        settings.store_configured(),
        settings.supabase_url.as_deref(),
        settings.supabase_anon_key.as_deref(),
    ) {
        info!(%url, "using hosted store");
        return Ok(Arc::new(HostedStore::new(url, key)?));
    }
    let storage = Storage::new(&settings.database_url).await?;
    Ok(Arc::new(storage))
}

async fn run(client: &Arc<HemoClient>, settings: &Settings, command: Command) -> Result<()> {
    match command {
        Command::List { search, blood_type } => {
            let filter = DonorFilter { search, blood_type };
            for donor in client.filtered_donors(&filter).await {
                println!(
                    "{}  {:<20} {:<4} {:<16} {:<14} {}{}",
                    donor.id,
                    donor.name,
                    donor.blood_type,
                    donor.location,
                    donor.contact,
                    if donor.is_available { "available" } else { "unavailable" },
                    donor
                        .last_notified
                        .map(|at| format!("  notified {}", at.format("%Y-%m-%d %H:%M")))
                        .unwrap_or_default(),
                );
            }
        }
        Command::Register {
            name,
            blood_type,
            contact,
            location,
            last_donation,
            unavailable,
        } => {
            client
                .add_donor(NewDonor {
                    name,
                    blood_type,
                    last_donation_date: last_donation,
                    contact,
                    location,
                    is_available: !unavailable,
                })
                .await?;
            println!("donor registered");
        }
        Command::Update {
            id,
            name,
            blood_type,
            contact,
            location,
            last_donation,
        } => {
            let patch = DonorPatch {
                name,
                blood_type,
                last_donation_date: last_donation.map(Some),
                contact,
                location,
                ..DonorPatch::default()
            };
            if patch.is_empty() {
                bail!("nothing to update");
            }
            client.update_donor(id, patch).await?;
            println!("donor {id} updated");
        }
        Command::Toggle { id } => {
            client.toggle_availability(id).await?;
            println!("availability toggled for {id}");
        }
        Command::Notify { id } => {
            client.notify_donor(id).await?;
            println!("donor {id} notified");
        }
        Command::Delete { id } => {
            client.delete_donor(id).await?;
            println!("donor {id} deleted");
        }
        Command::Inventory => {
            for item in client.inventory().await {
                println!("{:<4} {:>3}  {:?}", item.blood_type, item.units, item.status);
            }
        }
        Command::Stats => {
            let stats = client.stats().await;
            println!("total donors:    {}", stats.total_donors);
            println!("critical alerts: {}", stats.critical_alerts);
            println!("available units: {}", stats.available_units);
        }
        Command::Broadcast {
            blood_type,
            hospital,
            units,
            urgency,
        } => {
            client
                .broadcast_emergency(NewEmergency {
                    blood_type,
                    hospital,
                    units_needed: units,
                    urgency,
                })
                .await?;
            println!("emergency broadcast sent");
        }
        Command::Watch => watch(client).await?,
        Command::Voice { input, output } => voice(client, settings, input, output).await?,
    }
    Ok(())
}

async fn watch(client: &Arc<HemoClient>) -> Result<()> {
    let mut events = client.subscribe_events();
    println!("watching {} donors, ctrl-c to stop", client.donors().await.len());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(ClientEvent::Activity(entry)) => {
                    println!("[{}] {}", entry.captured_at.format("%H:%M:%S"), entry.message);
                }
                Ok(ClientEvent::EmergencyRaised(emergency)) => {
                    println!(
                        "EMERGENCY {:?}: {} needs {} units of {}",
                        emergency.urgency,
                        emergency.hospital,
                        emergency.units_needed,
                        emergency.blood_type
                    );
                }
                Ok(ClientEvent::Alert(message)) | Ok(ClientEvent::Error(message)) => {
                    eprintln!("{message}");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("missed {skipped} updates");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn voice(
    client: &Arc<HemoClient>,
    settings: &Settings,
    input: PathBuf,
    output: PathBuf,
) -> Result<()> {
    let Some(api_key) = settings.api_key.clone() else {
        bail!("API_KEY is not set");
    };
    let connector = LiveSocketConnector::new(&settings.live_endpoint, api_key)?;
    let coordinator = VoiceCoordinator::new(
        Arc::new(connector),
        Arc::new(PcmFileBackend::new(input, output)),
        client.clone(),
        session_config(&settings.live_model, &settings.voice_name),
    );
    let mut events = coordinator.subscribe_events();
    coordinator.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(VoiceEvent::StateChanged(VoiceState::Active)) => println!("listening"),
                Ok(VoiceEvent::StateChanged(VoiceState::Idle)) => break,
                Ok(VoiceEvent::Transcripts(lines)) => {
                    if let Some(line) = lines.last() {
                        println!("{line}");
                    }
                }
                Ok(VoiceEvent::Processing(true)) => println!("(working)"),
                Ok(VoiceEvent::Error(message)) => eprintln!("voice error: {message}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    coordinator.stop();
    Ok(())
}
