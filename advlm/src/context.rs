//! Rolling game context used to ground narrator responses.
//!
//! The host reports what happens (printed text, room changes, flags, score,
//! player input) and the resolver embeds a rendering of the result in the
//! narrator prompt.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Events kept in the history ring.
pub const HISTORY_CAPACITY: usize = 50;
/// Events shown by [`GameContext::rendered`].
pub const RENDERED_EVENTS: usize = 20;
/// Characters kept per event.
pub const EVENT_TEXT_LIMIT: usize = 511;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Player,
    Game,
    Room,
    Success,
    Fail,
    Inventory,
    Flag,
    Scene,
    Npc,
    System,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Player => "PLAYER",
            Self::Game => "GAME",
            Self::Room => "ROOM",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Inventory => "INVENTORY",
            Self::Flag => "FLAG",
            Self::Scene => "SCENE",
            Self::Npc => "NPC",
            Self::System => "SYSTEM",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextEvent {
    pub kind: EventKind,
    /// Room the player was in when it happened.
    pub room: u16,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub number: u16,
    pub description: String,
    pub exits: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedFlag {
    pub number: u16,
    pub description: String,
    pub set: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot<'a> {
    room: u16,
    score: i32,
    max_score: i32,
    room_description: &'a str,
    exits: &'a str,
    inventory: &'a [String],
    flags: &'a [TrackedFlag],
    history_count: usize,
    recent: Vec<&'a ContextEvent>,
}

/// Everything the narrator should know about the game so far.
#[derive(Debug, Clone, Default)]
pub struct GameContext {
    room: RoomInfo,
    score: i32,
    max_score: i32,
    history: VecDeque<ContextEvent>,
    inventory: Vec<String>,
    flags: Vec<TrackedFlag>,
    known_rooms: HashMap<u16, (String, String)>,
    /// Cached [`RENDERED_EVENTS`] rendering; `None` when stale.
    rendered: Option<String>,
}

impl GameContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing has been reported yet.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
            && self.room.description.is_empty()
            && self.inventory.is_empty()
            && self.score == 0
    }

    pub fn room(&self) -> &RoomInfo {
        &self.room
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn history(&self) -> impl Iterator<Item = &ContextEvent> {
        self.history.iter()
    }

    /// Drop the event history. Room, inventory and flags stay.
    pub fn clear(&mut self) {
        self.history.clear();
        self.invalidate();
    }

    /// Append an event, evicting the oldest once the ring is full.
    pub fn add(&mut self, kind: EventKind, text: &str) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        let text = match text.char_indices().nth(EVENT_TEXT_LIMIT) {
            Some((idx, _)) => &text[..idx],
            None => text,
        };
        self.history.push_back(ContextEvent {
            kind,
            room: self.room.number,
            text: text.to_string(),
        });
        self.invalidate();
    }

    pub fn set_room(&mut self, number: u16, description: &str, exits: &str) {
        self.room = RoomInfo {
            number,
            description: description.to_string(),
            exits: exits.to_string(),
        };
        self.invalidate();
    }

    pub fn set_max_score(&mut self, max_score: i32) {
        self.max_score = max_score;
        self.invalidate();
    }

    pub fn add_inventory(&mut self, item: &str) {
        self.inventory.push(item.to_string());
        self.add(EventKind::Inventory, &format!("Got {item}"));
    }

    pub fn remove_inventory(&mut self, item: &str) {
        if let Some(pos) = self.inventory.iter().position(|i| i == item) {
            self.inventory.remove(pos);
            self.add(EventKind::Inventory, &format!("Lost {item}"));
        }
    }

    /// Start reporting `number` under `description`. Re-tracking renames it.
    pub fn track_flag(&mut self, number: u16, description: &str) {
        match self.flags.iter_mut().find(|f| f.number == number) {
            Some(flag) => flag.description = description.to_string(),
            None => self.flags.push(TrackedFlag {
                number,
                description: description.to_string(),
                set: false,
            }),
        }
        self.invalidate();
    }

    pub fn on_print(&mut self, text: &str) {
        self.add(EventKind::Game, text);
    }

    /// Record a move and pick up the new room's description when known.
    pub fn on_room_change(&mut self, old_room: u16, new_room: u16) {
        self.add(
            EventKind::Room,
            &format!("Moved from room {old_room} to room {new_room}"),
        );
        let (description, exits) = self.known_rooms.get(&new_room).cloned().unwrap_or_default();
        self.set_room(new_room, &description, &exits);
    }

    /// Untracked flags are ignored.
    pub fn on_flag_change(&mut self, number: u16, set: bool) {
        let Some(flag) = self.flags.iter_mut().find(|f| f.number == number) else {
            return;
        };
        flag.set = set;
        let text = format!("{}: {}", flag.description, set);
        self.add(EventKind::Flag, &text);
    }

    pub fn on_score_change(&mut self, score: i32) {
        self.score = score;
        self.add(EventKind::System, &format!("Score changed to {score}"));
    }

    pub fn on_player_input(&mut self, input: &str) {
        self.add(EventKind::Player, input);
    }

    /// Most recent non-empty player input.
    pub fn last_player_input(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::Player)
            .map(|e| e.text.as_str())
            .filter(|text| !text.is_empty())
    }

    /// Blank the most recent player input so it is not reused.
    pub fn clear_last_player_input(&mut self) {
        if let Some(event) = self.history.iter_mut().rev().find(|e| e.kind == EventKind::Player) {
            event.text.clear();
            self.invalidate();
        }
    }

    /// Render the context with the last `max_events` events.
    pub fn render(&self, max_events: usize) -> String {
        let mut out = String::with_capacity(1024);
        let _ = write!(
            out,
            "=== GAME STATE ===\nRoom: {}\nScore: {}/{}\n\n",
            self.room.number, self.score, self.max_score
        );

        if !self.room.description.is_empty() {
            let _ = writeln!(out, "=== CURRENT LOCATION ===\n{}", self.room.description);
            if !self.room.exits.is_empty() {
                let _ = writeln!(out, "Exits: {}", self.room.exits);
            }
            out.push('\n');
        }

        if !self.inventory.is_empty() {
            out.push_str("=== INVENTORY ===\n");
            for item in &self.inventory {
                let _ = writeln!(out, "- {item}");
            }
            out.push('\n');
        }

        if !self.flags.is_empty() {
            out.push_str("=== GAME FLAGS ===\n");
            for flag in self.flags.iter().filter(|f| f.set) {
                let _ = writeln!(out, "- {}", flag.description);
            }
            out.push('\n');
        }

        out.push_str("=== RECENT EVENTS ===\n");
        out.push_str(&self.recent_events(max_events));
        out
    }

    /// Cached rendering with [`RENDERED_EVENTS`] events.
    pub fn rendered(&mut self) -> &str {
        if self.rendered.is_none() {
            self.rendered = Some(self.render(RENDERED_EVENTS));
        }
        self.rendered.as_deref().unwrap_or_default()
    }

    /// The last `max_events` events as `[KIND] text` lines.
    pub fn recent_events(&self, max_events: usize) -> String {
        let skip = self.history.len().saturating_sub(max_events);
        let mut out = String::new();
        for event in self.history.iter().skip(skip) {
            let _ = writeln!(out, "[{}] {}", event.kind, event.text);
        }
        out
    }

    /// JSON snapshot for chat APIs and debugging.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let skip = self.history.len().saturating_sub(RENDERED_EVENTS);
        serde_json::to_string_pretty(&Snapshot {
            room: self.room.number,
            score: self.score,
            max_score: self.max_score,
            room_description: &self.room.description,
            exits: &self.room.exits,
            inventory: &self.inventory,
            flags: &self.flags,
            history_count: self.history.len(),
            recent: self.history.iter().skip(skip).collect(),
        })
    }

    /// Register room descriptions from `room|description|exits` lines.
    /// Returns how many were read.
    pub fn add_room_descriptions(&mut self, text: &str) -> usize {
        let mut count = 0;
        for line in text.lines() {
            let mut fields = line.split('|');
            let (Some(number), Some(description)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(number) = number.trim().parse::<u16>() else {
                log::debug!("Skipping room line {:?}", line);
                continue;
            };
            let exits = fields.next().unwrap_or_default();
            self.known_rooms
                .insert(number, (description.to_string(), exits.to_string()));
            count += 1;
        }
        count
    }

    /// Track flags from `flag|description` lines. Returns how many were read.
    pub fn add_flag_descriptions(&mut self, text: &str) -> usize {
        let mut count = 0;
        for line in text.lines() {
            let Some((number, description)) = line.split_once('|') else {
                continue;
            };
            let Ok(number) = number.trim().parse::<u16>() else {
                log::debug!("Skipping flag line {:?}", line);
                continue;
            };
            self.track_flag(number, description.split('|').next().unwrap_or_default());
            count += 1;
        }
        count
    }

    pub fn load_room_descriptions(&mut self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read room descriptions {}", path.display()))?;
        let count = self.add_room_descriptions(&text);
        log::info!("Loaded {} room descriptions from {}", count, path.display());
        Ok(count)
    }

    pub fn load_flag_descriptions(&mut self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read flag descriptions {}", path.display()))?;
        let count = self.add_flag_descriptions(&text);
        log::info!("Loaded {} flag descriptions from {}", count, path.display());
        Ok(count)
    }

    fn invalidate(&mut self) {
        self.rendered = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_latest_entries() {
        let mut ctx = GameContext::new();
        for i in 0..(HISTORY_CAPACITY + 5) {
            ctx.on_print(&format!("line {i}"));
        }
        assert_eq!(ctx.history().count(), HISTORY_CAPACITY);
        assert_eq!(ctx.history().next().unwrap().text, "line 5");
    }

    #[test]
    fn test_render_sections() {
        let mut ctx = GameContext::new();
        ctx.set_max_score(158);
        ctx.add_room_descriptions("2|You are outside the castle.|north, south\n");
        ctx.on_room_change(1, 2);
        ctx.add_inventory("dagger");
        ctx.track_flag(7, "Drawbridge is down");
        ctx.on_flag_change(7, true);
        ctx.on_score_change(3);
        ctx.on_player_input("mira el castillo");

        let text = ctx.render(RENDERED_EVENTS);
        assert!(text.starts_with("=== GAME STATE ===\nRoom: 2\nScore: 3/158\n\n"));
        assert!(text.contains("=== CURRENT LOCATION ===\nYou are outside the castle.\nExits: north, south\n\n"));
        assert!(text.contains("=== INVENTORY ===\n- dagger\n"));
        assert!(text.contains("=== GAME FLAGS ===\n- Drawbridge is down\n"));
        assert!(text.contains("[ROOM] Moved from room 1 to room 2\n"));
        assert!(text.contains("[FLAG] Drawbridge is down: true\n"));
        assert!(text.ends_with("[PLAYER] mira el castillo\n"));
    }

    #[test]
    fn test_render_limits_events() {
        let mut ctx = GameContext::new();
        for i in 0..30 {
            ctx.on_print(&format!("line {i}"));
        }
        let text = ctx.render(3);
        assert!(!text.contains("line 26"));
        assert!(text.contains("[GAME] line 27\n[GAME] line 28\n[GAME] line 29\n"));
    }

    #[test]
    fn test_rendering_cached_until_change() {
        let mut ctx = GameContext::new();
        ctx.on_print("first");
        let before = ctx.rendered().to_string();
        assert_eq!(ctx.rendered(), before);
        ctx.on_print("second");
        assert!(ctx.rendered().contains("[GAME] second"));
    }

    #[test]
    fn test_last_player_input() {
        let mut ctx = GameContext::new();
        assert_eq!(ctx.last_player_input(), None);
        ctx.on_player_input("abre la puerta");
        ctx.on_print("The door is locked.");
        assert_eq!(ctx.last_player_input(), Some("abre la puerta"));
        ctx.clear_last_player_input();
        assert_eq!(ctx.last_player_input(), None);
    }

    #[test]
    fn test_untracked_flag_ignored() {
        let mut ctx = GameContext::new();
        ctx.on_flag_change(99, true);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_long_event_truncated() {
        let mut ctx = GameContext::new();
        ctx.on_print(&"é".repeat(600));
        assert_eq!(ctx.history().next().unwrap().text.chars().count(), EVENT_TEXT_LIMIT);
    }

    #[test]
    fn test_to_json() {
        let mut ctx = GameContext::new();
        ctx.set_room(4, "A dark cave.", "west");
        ctx.on_player_input("look");
        let json: serde_json::Value = serde_json::from_str(&ctx.to_json().unwrap()).unwrap();
        assert_eq!(json["room"], 4);
        assert_eq!(json["roomDescription"], "A dark cave.");
        assert_eq!(json["historyCount"], 1);
        assert_eq!(json["recent"][0]["kind"], "player");
    }

    #[test]
    fn test_load_descriptions_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let rooms = dir.path().join("rooms.txt");
        let flags = dir.path().join("flags.txt");
        std::fs::write(&rooms, "1|Castle gate|north\nbad line\nx|oops\n").unwrap();
        std::fs::write(&flags, "3|Door unlocked\n").unwrap();

        let mut ctx = GameContext::new();
        assert_eq!(ctx.load_room_descriptions(&rooms).unwrap(), 1);
        assert_eq!(ctx.load_flag_descriptions(&flags).unwrap(), 1);
        assert!(ctx.load_room_descriptions(&dir.path().join("missing.txt")).is_err());

        ctx.on_room_change(0, 1);
        assert_eq!(ctx.room().description, "Castle gate");
    }
}
