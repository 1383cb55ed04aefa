#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for exercising a gateway test inbox (read-only beyond creating
//! and tearing down inboxes)

use clap::{Parser, Subcommand};
use gateway_client::{Client, ClientConfig, CreateInboxOptions, DeliveryMode, Email, MatchOptions};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Read-only CLI for the email testing gateway")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Delivery strategy used while the command runs
    #[arg(long, global = true, value_enum, default_value = "auto")]
    mode: Mode,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Mode {
    Push,
    Poll,
    Auto,
}

impl From<Mode> for DeliveryMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Push => Self::Push,
            Mode::Poll => Self::Poll,
            Mode::Auto => Self::Auto,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a temporary inbox
    CreateInbox {
        /// Request an encrypted inbox (post-quantum envelope decryption)
        #[arg(long)]
        encrypted: bool,

        /// Requested lifetime in seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Requested local part / full address, if the gateway allows it
        #[arg(long)]
        address: Option<String>,
    },

    /// Block until a matching email arrives, then print it
    Wait {
        /// Inbox to watch, as returned by `create-inbox`
        email_address: String,

        /// Exact subject match
        #[arg(long)]
        subject: Option<String>,

        /// Subject regex match
        #[arg(long)]
        subject_regex: Option<String>,

        /// Exact sender match
        #[arg(long)]
        from: Option<String>,

        /// How long to wait before giving up, in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Export an inbox's identity and key material to re-import later
    Export {
        email_address: String,
    },

    /// Delete a single inbox
    DeleteInbox {
        email_address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ClientConfig::from_env()?.with_mode(args.mode.into());
    let client = Client::new(config)?;

    match &args.command {
        Command::CreateInbox {
            encrypted,
            ttl,
            address,
        } => cmd_create_inbox(&client, &args, *encrypted, *ttl, address.clone()).await?,
        Command::Wait {
            email_address,
            subject,
            subject_regex,
            from,
            timeout,
        } => {
            cmd_wait(
                &client,
                &args,
                email_address,
                subject.clone(),
                subject_regex.clone(),
                from.clone(),
                *timeout,
            )
            .await?;
        }
        Command::Export { email_address } => cmd_export(&client, &args, email_address).await?,
        Command::DeleteInbox { email_address } => {
            client.delete_inbox(email_address).await?;
            println!("deleted {email_address}");
        }
    }

    client.close().await;
    Ok(())
}

async fn cmd_create_inbox(
    client: &Client,
    args: &Args,
    encrypted: bool,
    ttl: Option<u64>,
    address: Option<String>,
) -> anyhow::Result<()> {
    let opts = CreateInboxOptions {
        ttl_secs: ttl,
        email_address: address,
        kem_public_key: None,
    };
    let inbox = client.create_inbox(opts, encrypted).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&inbox.export(chrono::Utc::now()))?);
    } else {
        println!("address:  {}", inbox.email_address);
        println!("hash:     {}", inbox.inbox_hash);
        println!("expires:  {}", inbox.expires_at);
        println!("encrypted: {}", inbox.encrypted);
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_wait(
    client: &Client,
    args: &Args,
    email_address: &str,
    subject: Option<String>,
    subject_regex: Option<String>,
    from: Option<String>,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let subject_regex = subject_regex.map(|pattern| regex::Regex::new(&pattern)).transpose()?;
    let opts = MatchOptions {
        subject,
        from,
        subject_regex,
        ..MatchOptions::default()
    };

    let email = client
        .wait_for_email(email_address, &opts, Duration::from_secs(timeout_secs))
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&email)?);
    } else {
        print_email(&email);
    }

    Ok(())
}

async fn cmd_export(client: &Client, args: &Args, email_address: &str) -> anyhow::Result<()> {
    let exported = client.export_inbox(email_address).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&exported)?);
    } else {
        println!("{}", serde_json::to_string(&exported)?);
    }

    Ok(())
}

fn print_email(email: &Email) {
    println!("id:      {}", email.id);
    println!("from:    {}", email.from);
    println!("to:      {}", email.to.join(", "));
    println!("subject: {}", email.subject);
    println!("date:    {}", email.received_at);
    println!();
    if let Some(text) = &email.text {
        println!("{text}");
    } else if let Some(html) = &email.html {
        println!("{html}");
    }

    if !email.attachments.is_empty() {
        println!("\n--- Attachments ---");
        for a in &email.attachments {
            println!("  {} ({} bytes, {})", a.filename, a.size, a.content_type);
        }
    }
}
