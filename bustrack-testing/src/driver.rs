use bustrack_logic::{Coordinate, EntityKey, PermissionLevel, Role};
use bustrack_test_shared::{
    PromptAnswers, TestingRequest, TestingResponse, get_socket_name, prelude::*,
};
use clap::{Parser, Subcommand, ValueEnum};
use interprocess::local_socket::{tokio::Stream, traits::tokio::Stream as _};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
struct Cli {
    /// Name of the local socket the test daemon is listening on
    socket: String,

    /// Keep printing session updates after the request completes
    #[arg(long, short)]
    follow: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleValue {
    /// Share this device's location
    Driver,
    /// Watch the shared location
    Rider,
}

impl From<RoleValue> for Role {
    fn from(value: RoleValue) -> Self {
        match value {
            RoleValue::Driver => Role::Publisher,
            RoleValue::Rider => Role::Subscriber,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LevelValue {
    Foreground,
    Background,
}

impl From<LevelValue> for PermissionLevel {
    fn from(value: LevelValue) -> Self {
        match value {
            LevelValue::Foreground => PermissionLevel::Foreground,
            LevelValue::Background => PermissionLevel::Background,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Store a driver credential
    Login { token: String },
    /// Stop tracking and forget the credential
    Logout,
    /// Open a tracking screen
    Mount {
        #[arg(value_enum)]
        role: RoleValue,
        /// Database path of the tracked bus
        #[arg(default_value = "busLocation")]
        key: String,
    },
    /// Close the tracking screen
    Unmount,
    /// Set how the next permission prompts are answered
    Permissions {
        #[arg(long)]
        deny_foreground: bool,
        #[arg(long)]
        deny_background: bool,
    },
    /// Take away a permission level without a prompt
    Revoke {
        #[arg(value_enum)]
        level: LevelValue,
    },
    /// Report a position from the device's sensor
    Sample {
        #[arg(allow_negative_numbers = true)]
        latitude: f64,
        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
    /// Make the device's sensor report an error
    SensorError { message: String },
}

impl TryFrom<Commands> for TestingRequest {
    type Error = anyhow::Error;

    fn try_from(value: Commands) -> Result<Self> {
        Ok(match value {
            Commands::Login { token } => TestingRequest::Login(token),
            Commands::Logout => TestingRequest::Logout,
            Commands::Mount { role, key } => {
                let key = EntityKey::new(&key).context("Invalid bus key")?;
                TestingRequest::Mount(role.into(), key)
            }
            Commands::Unmount => TestingRequest::Unmount,
            Commands::Permissions {
                deny_foreground,
                deny_background,
            } => TestingRequest::SetPermissions(PromptAnswers {
                foreground: !deny_foreground,
                background: !deny_background,
            }),
            Commands::Revoke { level } => TestingRequest::Revoke(level.into()),
            Commands::Sample {
                latitude,
                longitude,
            } => TestingRequest::Sample(Coordinate::new(latitude, longitude)),
            Commands::SensorError { message } => TestingRequest::SensorError(message),
        })
    }
}

#[tokio::main]
async fn main() -> Result {
    let cli = Cli::parse();

    let req = TestingRequest::try_from(cli.command)?;

    let socket_name = get_socket_name(cli.socket.clone()).context("Failed to get socket name")?;

    let stream = Stream::connect(socket_name)
        .await
        .context("Failed to connect to socket")?;

    let mut encoded = serde_json::to_vec(&req).context("Failed to encode request")?;
    encoded.push(b'\n');
    let mut send = &stream;
    send.write_all(&encoded)
        .await
        .context("Failed to send request")?;

    let mut lines = BufReader::new(&stream).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read response")?,
            Ok(_) = tokio::signal::ctrl_c() => break,
        };

        let Some(line) = line else {
            break;
        };

        let resp = serde_json::from_str::<TestingResponse>(&line)
            .context("Failed to parse response")?;

        println!("{resp:?}");

        match resp {
            TestingResponse::Complete if !cli.follow => break,
            TestingResponse::Error(why) if !cli.follow => bail!("Daemon failed request: {why}"),
            _ => {}
        }
    }

    Ok(())
}
