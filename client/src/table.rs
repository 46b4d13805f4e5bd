//! Table topics and the commands a participant can issue against them

use client::{SyncClient, Topic, TopicUpdate};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::TopicPolicy;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

pub const SEAT_COUNT: u8 = 4;
pub const MOUSE_RATE_LIMIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchInfo {
    pub dealer: u8,
    pub honba: u32,
    pub game_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatInfo {
    pub seat: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingInfo {
    pub slot_name: String,
    pub rotation_index: u8,
    pub claimed_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseInfo {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundInfo {
    pub kind: String,
    pub side: Option<u8>,
}

/// Who sits where, derived from the `seats` topic
#[derive(Debug, Default)]
pub struct SeatLayout {
    occupants: HashMap<String, u8>,
    own_id: Option<String>,
}

impl SeatLayout {
    pub fn set_own_id(&mut self, own_id: Option<String>) {
        self.own_id = own_id;
    }

    pub fn apply(&mut self, update: &TopicUpdate<String, SeatInfo>) {
        if update.full {
            self.occupants.clear();
        }
        for (player, info) in &update.entries {
            match info.as_ref().and_then(|info| info.seat) {
                Some(seat) => {
                    self.occupants.insert(player.clone(), seat);
                }
                None => {
                    self.occupants.remove(player);
                }
            }
        }
    }

    /// Seat taken by this participant
    pub fn own_seat(&self) -> Option<u8> {
        self.own_id
            .as_ref()
            .and_then(|id| self.occupants.get(id).copied())
    }

    /// Player in each seat, indexed by seat number
    pub fn players(&self) -> Vec<Option<String>> {
        let mut players = vec![None; SEAT_COUNT as usize];
        for (player, seat) in &self.occupants {
            if let Some(slot) = players.get_mut(*seat as usize) {
                *slot = Some(player.clone());
            }
        }
        players
    }
}

/// Every topic of one table, registered on a [`SyncClient`].
///
/// `match` is registered first so its snapshot is applied before seats and
/// things when a batch carries all of them.
pub struct Table {
    pub match_info: Topic<u32, MatchInfo>,
    pub seats: Topic<String, SeatInfo>,
    pub things: Topic<u32, ThingInfo>,
    pub nicks: Topic<String, String>,
    pub mouse: Topic<String, MouseInfo>,
    pub sound: Topic<u32, SoundInfo>,
    pub spectators: Topic<String, String>,
    pub layout: Rc<RefCell<SeatLayout>>,
}

impl Table {
    pub fn register(client: &SyncClient) -> Self {
        let table = Self {
            match_info: client.topic("match", TopicPolicy::new().send_on_connect()),
            seats: client.topic("seats", TopicPolicy::new().unique_key("seat").per_participant()),
            things: client.topic(
                "things",
                TopicPolicy::new().unique_key("slotName").send_on_connect(),
            ),
            nicks: client.topic("nicks", TopicPolicy::new().per_participant()),
            mouse: client.topic(
                "mouse",
                TopicPolicy::new().rate_limit(MOUSE_RATE_LIMIT).per_participant(),
            ),
            sound: client.topic("sound", TopicPolicy::new().ephemeral()),
            spectators: client.topic("spectators", TopicPolicy::new().per_participant()),
            layout: Rc::new(RefCell::new(SeatLayout::default())),
        };

        let layout = Rc::clone(&table.layout);
        let link = client.link();
        table.seats.on_update(move |update| {
            let mut layout = layout.borrow_mut();
            layout.set_own_id(link.player_id());
            layout.apply(update);
            debug!("Seats now {:?}", layout.players());
        });

        table.spectators.on_policy_changed(|policy| {
            info!(
                "Spectating is {}",
                if policy.is_write_protected() {
                    "password protected"
                } else {
                    "open"
                }
            );
        });

        table.sound.on_update(|update| {
            for (_, sound) in &update.entries {
                if let Some(sound) = sound {
                    info!("Sound: {} (side {:?})", sound.kind, sound.side);
                }
            }
        });

        table
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Nick(String),
    Sit(u8),
    Stand,
    Mouse(MouseInfo),
    Spectate(bool),
    Protect,
    Auth(String),
    Show,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match name {
            "nick" if !args.is_empty() => Command::Nick(args.join(" ")),
            "nick" => return Err(CommandError::Usage("nick <name>")),
            "sit" => match args.first().and_then(|seat| seat.parse::<u8>().ok()) {
                Some(seat) if seat < SEAT_COUNT => Command::Sit(seat),
                _ => return Err(CommandError::Usage("sit <0-3>")),
            },
            "stand" => Command::Stand,
            "mouse" => {
                let coords: Vec<f32> = args.iter().filter_map(|v| v.parse().ok()).collect();
                match coords[..] {
                    [x, y, z] if args.len() == 3 => Command::Mouse(MouseInfo { x, y, z }),
                    _ => return Err(CommandError::Usage("mouse <x> <y> <z>")),
                }
            }
            "spectate" => match args.first().copied() {
                None | Some("on") => Command::Spectate(true),
                Some("off") => Command::Spectate(false),
                Some(_) => return Err(CommandError::Usage("spectate [on|off]")),
            },
            "protect" => Command::Protect,
            "auth" => match args.first() {
                Some(credential) => Command::Auth(credential.to_string()),
                None => return Err(CommandError::Usage("auth <credential>")),
            },
            "show" => Command::Show,
            "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}
