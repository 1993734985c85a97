use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Maximum number of hot cues VirtualDJ shows per track.
pub const MAX_HOT_CUES: usize = 8;

/// Lowercase extensions treated as playable audio.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "flac", "wav", "aiff", "aif", "ogg", "opus", "wma", "alac",
];

/// One catalog entry, keyed by its file path.
///
/// Known attributes are typed; anything else found on the `Tags`, `Infos`,
/// `Scan`, or `Song` elements lands in `extra` under `"Element.Attribute"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub file_path: String,
    pub file_size: Option<u64>,
    pub tags: Tags,
    pub infos: Infos,
    pub scan: Scan,
    /// Every `Poi` child in document order (cues, beatgrid, loops, ...).
    pub cue_points: Vec<CuePoint>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tags {
    pub author: Option<String>,
    pub title: Option<String>,
    pub genre: Option<String>,
    pub album: Option<String>,
    pub composer: Option<String>,
    pub remix: Option<String>,
    pub label: Option<String>,
    pub comment: Option<String>,
    /// Energy level lives here, as `7` or the legacy `Energy 7`.
    pub grouping: Option<String>,
    pub user1: Option<String>,
    /// Space separated hashtags (`#Mellow #happy`).
    pub user2: Option<String>,
    pub year: Option<i32>,
    pub track_number: Option<u32>,
    pub rating: Option<u8>,
    pub color: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Infos {
    /// Seconds.
    pub song_length: Option<f64>,
    /// kbps.
    pub bitrate: Option<u32>,
    pub play_count: Option<u32>,
    pub first_seen: Option<i64>,
    pub last_play: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    /// Beat interval in seconds (0.5 == 120 BPM).
    pub bpm: Option<f64>,
    pub key: Option<String>,
    /// Linear gain applied by VirtualDJ.
    pub volume: Option<f64>,
    pub flag: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoiKind {
    Cue,
    Beatgrid,
    Loop,
    Remix,
    Automix,
    Other(String),
}

impl PoiKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "cue" => Self::Cue,
            "beatgrid" => Self::Beatgrid,
            "loop" => Self::Loop,
            "remix" => Self::Remix,
            "automix" => Self::Automix,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Cue => "cue",
            Self::Beatgrid => "beatgrid",
            Self::Loop => "loop",
            Self::Remix => "remix",
            Self::Automix => "automix",
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuePoint {
    pub kind: PoiKind,
    /// Position in seconds.
    pub pos: f64,
    pub num: Option<u32>,
    pub name: Option<String>,
    pub color: Option<String>,
}

impl CuePoint {
    pub fn cue(num: u32, pos: f64, name: impl Into<String>) -> Self {
        Self {
            kind: PoiKind::Cue,
            pos,
            num: Some(num),
            name: Some(name.into()),
            color: None,
        }
    }
}

impl Record {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            ..Self::default()
        }
    }

    /// Energy level 1-10 from Grouping.
    ///
    /// Reads the current plain form (`"7"`) and the legacy `"Energy 7"` form.
    pub fn energy(&self) -> Option<u8> {
        parse_energy(self.tags.grouping.as_deref()?)
    }

    /// Mood tag: the last lowercase hashtag in User2.
    pub fn mood(&self) -> Option<&str> {
        self.tags
            .user2
            .as_deref()?
            .split_whitespace()
            .filter_map(|tag| tag.strip_prefix('#'))
            .filter(|tag| !tag.is_empty() && !tag.chars().any(char::is_uppercase))
            .last()
    }

    /// Scan beat interval converted to beats per minute.
    pub fn actual_bpm(&self) -> Option<f64> {
        match self.scan.bpm {
            Some(interval) if interval > 0.0 => Some(60.0 / interval),
            _ => None,
        }
    }

    pub fn hot_cues(&self) -> impl Iterator<Item = &CuePoint> {
        self.cue_points.iter().filter(|p| p.kind == PoiKind::Cue)
    }

    pub fn is_windows_path(&self) -> bool {
        self.file_path.as_bytes().get(1) == Some(&b':')
    }

    /// Streaming entries (`td123456://...`, `netsearch://...`).
    pub fn is_netsearch(&self) -> bool {
        self.file_path.contains("://") && !self.file_path.starts_with("file://")
    }

    pub fn extension(&self) -> String {
        Path::new(&self.file_path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    pub fn is_audio(&self) -> bool {
        AUDIO_EXTENSIONS.contains(&self.extension().as_str())
    }

    pub fn display_name(&self) -> String {
        match (&self.tags.author, &self.tags.title) {
            (Some(author), Some(title)) => format!("{author} - {title}"),
            (_, Some(title)) => title.clone(),
            _ => Path::new(&self.file_path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.file_path.clone()),
        }
    }

    /// Store a raw attribute value read from the document.
    ///
    /// Values that do not parse into the typed field are kept in `extra`
    /// so nothing read from disk disappears from the view.
    pub(crate) fn read_attribute(&mut self, element: &str, name: &str, value: &str) {
        let Some(field) = RecordField::lookup(element, name) else {
            if !(element == "Song" && name == "FilePath") {
                self.extra
                    .insert(format!("{element}.{name}"), value.to_string());
            }
            return;
        };
        if !self.assign(field, value) {
            self.extra
                .insert(format!("{element}.{name}"), value.to_string());
        }
    }

    fn assign(&mut self, field: RecordField, value: &str) -> bool {
        fn text(slot: &mut Option<String>, value: &str) -> bool {
            *slot = Some(value.to_string());
            true
        }
        fn num<T: std::str::FromStr>(slot: &mut Option<T>, value: &str) -> bool {
            match value.trim().parse() {
                Ok(parsed) => {
                    *slot = Some(parsed);
                    true
                }
                Err(_) => false,
            }
        }
        use RecordField as F;
        match field {
            F::FileSize => num(&mut self.file_size, value),
            F::Author => text(&mut self.tags.author, value),
            F::Title => text(&mut self.tags.title, value),
            F::Genre => text(&mut self.tags.genre, value),
            F::Album => text(&mut self.tags.album, value),
            F::Composer => text(&mut self.tags.composer, value),
            F::Remix => text(&mut self.tags.remix, value),
            F::Label => text(&mut self.tags.label, value),
            F::Comment => text(&mut self.tags.comment, value),
            F::Grouping => text(&mut self.tags.grouping, value),
            F::User1 => text(&mut self.tags.user1, value),
            F::User2 => text(&mut self.tags.user2, value),
            F::Year => num(&mut self.tags.year, value),
            F::TrackNumber => num(&mut self.tags.track_number, value),
            F::Rating => num(&mut self.tags.rating, value),
            F::Color => text(&mut self.tags.color, value),
            F::TagKey => text(&mut self.tags.key, value),
            F::SongLength => num(&mut self.infos.song_length, value),
            F::Bitrate => num(&mut self.infos.bitrate, value),
            F::PlayCount => num(&mut self.infos.play_count, value),
            F::FirstSeen => num(&mut self.infos.first_seen, value),
            F::LastPlay => num(&mut self.infos.last_play, value),
            F::ScanBpm => num(&mut self.scan.bpm, value),
            F::ScanKey => text(&mut self.scan.key, value),
            F::Volume => num(&mut self.scan.volume, value),
            F::ScanFlag => num(&mut self.scan.flag, value),
        }
    }

    /// Current value of a typed field, formatted the way it is written.
    pub fn field_text(&self, field: RecordField) -> Option<String> {
        use RecordField as F;
        match field {
            F::FileSize => self.file_size.map(|v| v.to_string()),
            F::Author => self.tags.author.clone(),
            F::Title => self.tags.title.clone(),
            F::Genre => self.tags.genre.clone(),
            F::Album => self.tags.album.clone(),
            F::Composer => self.tags.composer.clone(),
            F::Remix => self.tags.remix.clone(),
            F::Label => self.tags.label.clone(),
            F::Comment => self.tags.comment.clone(),
            F::Grouping => self.tags.grouping.clone(),
            F::User1 => self.tags.user1.clone(),
            F::User2 => self.tags.user2.clone(),
            F::Year => self.tags.year.map(|v| v.to_string()),
            F::TrackNumber => self.tags.track_number.map(|v| v.to_string()),
            F::Rating => self.tags.rating.map(|v| v.to_string()),
            F::Color => self.tags.color.clone(),
            F::TagKey => self.tags.key.clone(),
            F::SongLength => self.infos.song_length.map(format_float),
            F::Bitrate => self.infos.bitrate.map(|v| v.to_string()),
            F::PlayCount => self.infos.play_count.map(|v| v.to_string()),
            F::FirstSeen => self.infos.first_seen.map(|v| v.to_string()),
            F::LastPlay => self.infos.last_play.map(|v| v.to_string()),
            F::ScanBpm => self.scan.bpm.map(format_float),
            F::ScanKey => self.scan.key.clone(),
            F::Volume => self.scan.volume.map(format_float),
            F::ScanFlag => self.scan.flag.map(|v| v.to_string()),
        }
    }
}

/// Parse a Grouping value into an energy level.
///
/// Only the two documented forms are accepted: a bare integer and
/// `Energy N` (case-insensitive). Anything outside 1..=10 is ignored.
pub fn parse_energy(grouping: &str) -> Option<u8> {
    let text = grouping.trim();
    let level = if text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
        text.parse::<u8>().ok()
    } else {
        let mut parts = text.split_whitespace();
        let mut found = None;
        while let Some(part) = parts.next() {
            if part.eq_ignore_ascii_case("energy") {
                found = parts.next().and_then(|n| n.parse::<u8>().ok());
                break;
            }
        }
        found
    }?;
    (1..=10).contains(&level).then_some(level)
}

pub(crate) fn format_float(value: f64) -> String {
    format!("{value}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Integer,
    Float,
}

/// Addressable attribute of a record: which element and attribute it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordField {
    FileSize,
    Author,
    Title,
    Genre,
    Album,
    Composer,
    Remix,
    Label,
    Comment,
    Grouping,
    User1,
    User2,
    Year,
    TrackNumber,
    Rating,
    Color,
    TagKey,
    SongLength,
    Bitrate,
    PlayCount,
    FirstSeen,
    LastPlay,
    ScanBpm,
    ScanKey,
    Volume,
    ScanFlag,
}

impl RecordField {
    pub const ALL: &'static [RecordField] = &[
        Self::FileSize,
        Self::Author,
        Self::Title,
        Self::Genre,
        Self::Album,
        Self::Composer,
        Self::Remix,
        Self::Label,
        Self::Comment,
        Self::Grouping,
        Self::User1,
        Self::User2,
        Self::Year,
        Self::TrackNumber,
        Self::Rating,
        Self::Color,
        Self::TagKey,
        Self::SongLength,
        Self::Bitrate,
        Self::PlayCount,
        Self::FirstSeen,
        Self::LastPlay,
        Self::ScanBpm,
        Self::ScanKey,
        Self::Volume,
        Self::ScanFlag,
    ];

    pub fn element(self) -> &'static str {
        use RecordField as F;
        match self {
            F::FileSize => "Song",
            F::SongLength | F::Bitrate | F::PlayCount | F::FirstSeen | F::LastPlay => "Infos",
            F::ScanBpm | F::ScanKey | F::Volume | F::ScanFlag => "Scan",
            _ => "Tags",
        }
    }

    pub fn attribute(self) -> &'static str {
        use RecordField as F;
        match self {
            F::FileSize => "FileSize",
            F::Author => "Author",
            F::Title => "Title",
            F::Genre => "Genre",
            F::Album => "Album",
            F::Composer => "Composer",
            F::Remix => "Remix",
            F::Label => "Label",
            F::Comment => "Comment",
            F::Grouping => "Grouping",
            F::User1 => "User1",
            F::User2 => "User2",
            F::Year => "Year",
            F::TrackNumber => "TrackNumber",
            F::Rating => "Rating",
            F::Color => "Color",
            F::TagKey => "Key",
            F::SongLength => "SongLength",
            F::Bitrate => "Bitrate",
            F::PlayCount => "PlayCount",
            F::FirstSeen => "FirstSeen",
            F::LastPlay => "LastPlay",
            F::ScanBpm => "Bpm",
            F::ScanKey => "Key",
            F::Volume => "Volume",
            F::ScanFlag => "Flag",
        }
    }

    fn kind(self) -> FieldKind {
        use RecordField as F;
        match self {
            F::FileSize
            | F::Year
            | F::TrackNumber
            | F::Rating
            | F::Bitrate
            | F::PlayCount
            | F::FirstSeen
            | F::LastPlay
            | F::ScanFlag => FieldKind::Integer,
            F::SongLength | F::ScanBpm | F::Volume => FieldKind::Float,
            _ => FieldKind::Text,
        }
    }

    pub fn lookup(element: &str, attribute: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.element() == element && f.attribute() == attribute)
    }

    /// Parse `"Tags.Grouping"`-style names used by the CLI.
    pub fn from_qualified(name: &str) -> Option<Self> {
        let (element, attribute) = name.split_once('.')?;
        Self::lookup(element, attribute)
    }

    /// Validate a value for this field and render the text to store.
    /// `Ok(None)` means the attribute is removed.
    pub(crate) fn render(self, value: &FieldValue) -> Result<Option<String>> {
        let invalid = |detail: String| {
            CatalogError::ValidationFailed(format!(
                "{}.{}: {detail}",
                self.element(),
                self.attribute()
            ))
        };
        let rendered = match (self.kind(), value) {
            (_, FieldValue::Clear) => return Ok(None),
            (FieldKind::Text, FieldValue::Text(text)) => text.clone(),
            (FieldKind::Text, FieldValue::Integer(n)) => n.to_string(),
            (FieldKind::Text, FieldValue::Float(f)) => format_float(*f),
            (FieldKind::Integer, FieldValue::Integer(n)) => self.check_integer(*n).map_err(invalid)?,
            (FieldKind::Integer, FieldValue::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                self.check_integer(*f as i64).map_err(invalid)?
            }
            (FieldKind::Integer, FieldValue::Text(text)) => {
                let n = text
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid(format!("'{text}' is not an integer")))?;
                self.check_integer(n).map_err(invalid)?
            }
            (FieldKind::Integer, FieldValue::Float(f)) => {
                return Err(invalid(format!("{f} is not an integer")));
            }
            (FieldKind::Float, FieldValue::Float(f)) => check_float(*f).map_err(invalid)?,
            (FieldKind::Float, FieldValue::Integer(n)) => check_float(*n as f64).map_err(invalid)?,
            (FieldKind::Float, FieldValue::Text(text)) => {
                let f = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("'{text}' is not a number")))?;
                check_float(f).map_err(invalid)?
            }
        };
        Ok(Some(rendered))
    }

    fn check_integer(self, n: i64) -> std::result::Result<String, String> {
        let range = match self {
            Self::Rating => 0..=5,
            Self::Year => 0..=9999,
            Self::FirstSeen | Self::LastPlay | Self::ScanFlag => i64::MIN..=i64::MAX,
            _ => 0..=i64::MAX,
        };
        if range.contains(&n) {
            Ok(n.to_string())
        } else {
            Err(format!("{n} outside {}..={}", range.start(), range.end()))
        }
    }
}

fn check_float(f: f64) -> std::result::Result<String, String> {
    if f.is_finite() {
        Ok(format_float(f))
    } else {
        Err(format!("{f} is not finite"))
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.element(), self.attribute())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Clear,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Ordered set of field assignments applied to one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    entries: Vec<(RecordField, FieldValue)>,
}

impl FieldUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field; a later assignment to the same field replaces the earlier one.
    pub fn set(mut self, field: RecordField, value: impl Into<FieldValue>) -> Self {
        let value = value.into();
        match self.entries.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((field, value)),
        }
        self
    }

    pub fn clear(self, field: RecordField) -> Self {
        self.set(field, FieldValue::Clear)
    }

    /// Write an energy level in the current plain-number form.
    pub fn energy(self, level: u8) -> Result<Self> {
        if !(1..=10).contains(&level) {
            return Err(CatalogError::ValidationFailed(format!(
                "energy level {level} outside 1..=10"
            )));
        }
        Ok(self.set(RecordField::Grouping, level.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(RecordField, FieldValue)> {
        self.entries.iter()
    }
}
