//! Input line handling: chat text or a slash command.

use tracing::info;

use meshroom_core::domain::session::Role;
use meshroom_core::RoomProtocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Peers,
    Retry,
    Restart,
    Quit,
    Help,
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Self::Chat(trimmed.to_owned());
        };
        match rest.split_whitespace().next().unwrap_or_default() {
            "peers" => Self::Peers,
            "retry" => Self::Retry,
            "restart" => Self::Restart,
            "quit" | "exit" => Self::Quit,
            "help" => Self::Help,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

pub const HELP: &str = "commands: /peers /retry /restart /quit /help; anything else is sent as chat";

/// Run `command` against the room. Returns `false` when the user asked to quit.
pub async fn execute(room: &mut RoomProtocol, command: Command) -> bool {
    match command {
        Command::Empty => {}
        Command::Chat(content) => {
            let message = room.send_message(content);
            println!("<{}> {}", message.sender, message.content);
        }
        Command::Peers => {
            let connected = room.peers();
            for member in room.members() {
                let marker = if member.id == *room.local_identity() {
                    " (you)"
                } else if connected.contains(&member.id) {
                    " (direct)"
                } else {
                    ""
                };
                println!("  {} [{}]{marker}", member.display_name, member.id);
            }
        }
        Command::Retry => {
            info!("Retry requested");
            if room.reset_and_retry().await.is_ok() {
                announce(room);
            }
        }
        Command::Restart => {
            info!("Restart requested");
            if room.restart().await.is_ok() {
                announce(room);
            }
        }
        Command::Quit => return false,
        Command::Help => println!("{HELP}"),
        Command::Unknown(name) => println!("unknown command /{name}; {HELP}"),
    }
    true
}

/// Tell the user where they are.
pub fn announce(room: &RoomProtocol) {
    match room.role() {
        Role::Host => println!(
            "* hosting room {} as {}; share the code to invite",
            room.room_code(),
            room.local_identity()
        ),
        Role::Joiner => println!(
            "* joined room {} as {}",
            room.room_code(),
            room.local_identity()
        ),
    }
}
