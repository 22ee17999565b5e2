use chrono::{Local, NaiveDate, NaiveTime};
use itertools::Itertools;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    fmt, fs,
    path::PathBuf,
    str::FromStr,
    sync::LazyLock,
};
use thiserror::Error;
use tracing::{debug, info};

// ---------- Errors ----------

#[derive(Debug, Error)]
pub enum Error {
    /// The word data could not be read or fetched. Never retried.
    #[error("could not load word data from {location}: {reason}")]
    DataLoad { location: String, reason: String },
    #[error("could not parse word data: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("the word data contains no puzzles")]
    EmptyPuzzleSet,
}

// ---------- Configuration ----------

pub const DEFAULT_DATA: &str = "webs.json";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Where the puzzle file lives: a local path or an http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Url(String),
    File(PathBuf),
}

impl FromStr for DataSource {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            Ok(Self::Url(s.to_string()))
        } else {
            Ok(Self::File(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{}", url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data: DataSource,
    pub bind_addr: String,
}

impl Config {
    /// Positional arguments: `[DATA] [BIND_ADDR]`.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut args = args.into_iter();
        let mut config = Self::default();
        if let Some(Ok(data)) = args.next().map(|arg| arg.parse()) {
            config.data = data;
        }
        if let Some(addr) = args.next() {
            config.bind_addr = addr;
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataSource::File(PathBuf::from(DEFAULT_DATA)),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

/// Installs a stderr `tracing` subscriber, filtered by `RUST_LOG` when set.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// ---------- Word data ----------

/// How close a candidate word is to the day's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Proximity {
    Far,
    Near,
    Exact,
}

impl Proximity {
    pub fn class(self) -> &'static str {
        match self {
            Self::Far => "far",
            Self::Near => "near",
            Self::Exact => "exact",
        }
    }
}

impl TryFrom<u8> for Proximity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Far),
            1 => Ok(Self::Near),
            2 => Ok(Self::Exact),
            other => Err(format!("proximity score must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl From<Proximity> for u8 {
    fn from(p: Proximity) -> Self {
        match p {
            Proximity::Far => 0,
            Proximity::Near => 1,
            Proximity::Exact => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WordEntry {
    #[serde(rename = "w")]
    pub word: String,
    #[serde(rename = "s")]
    pub proximity: Proximity,
    #[serde(rename = "d")]
    pub chain: String,
}

/// One day's candidate words, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Puzzle(pub Vec<WordEntry>);

impl Puzzle {
    pub fn entries(&self) -> &[WordEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn parse_puzzles(json: &str) -> Result<Vec<Puzzle>, Error> {
    Ok(serde_json::from_str(json)?)
}

pub fn load_puzzles(source: &DataSource) -> Result<Vec<Puzzle>, Error> {
    let text = match source {
        DataSource::Url(url) => fetch_text(url)?,
        DataSource::File(path) => fs::read_to_string(path).map_err(|e| Error::DataLoad {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?,
    };
    let puzzles = parse_puzzles(&text)?;
    info!(source = %source, puzzles = puzzles.len(), "loaded word data");
    Ok(puzzles)
}

fn fetch_text(url: &str) -> Result<String, Error> {
    let fail = |reason: String| Error::DataLoad {
        location: url.to_string(),
        reason,
    };
    let response = reqwest::blocking::get(url).map_err(|e| fail(e.to_string()))?;
    if !response.status().is_success() {
        return Err(fail(format!("HTTP {}", response.status())));
    }
    response.text().map_err(|e| fail(e.to_string()))
}

// ---------- Puzzle selection ----------

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Puzzle numbering starts two days after the Unix epoch.
const PUZZLE_NUMBER_OFFSET: i64 = 2;

/// Day count for a local calendar date; changes only at local midnight.
pub fn day_number(date: NaiveDate) -> u64 {
    let midnight_ms = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    (midnight_ms.div_euclid(MS_PER_DAY) - PUZZLE_NUMBER_OFFSET).max(0) as u64
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Reads a puzzle number out of a page URL: the whole query component, a
/// `puzzle=N` query parameter, or the whole fragment, in that order.
pub fn puzzle_override(url: &str) -> Option<u64> {
    let (rest, fragment) = match url.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (url, None),
    };
    let query = rest.split_once('?').map(|(_, q)| q);

    query
        .and_then(parse_override_component)
        .or_else(|| fragment.and_then(parse_override_component))
}

fn parse_override_component(component: &str) -> Option<u64> {
    if let Ok(n) = component.parse() {
        return Some(n);
    }
    component
        .split('&')
        .find_map(|pair| pair.strip_prefix("puzzle="))
        .and_then(|v| v.parse().ok())
}

/// The override wins verbatim; clamping happens in [`select_puzzle`].
pub fn choose_puzzle_index(today: NaiveDate, override_index: Option<u64>) -> u64 {
    override_index.unwrap_or_else(|| day_number(today))
}

pub fn select_puzzle(puzzles: &[Puzzle], selection: u64) -> Result<(usize, &Puzzle), Error> {
    if puzzles.is_empty() {
        return Err(Error::EmptyPuzzleSet);
    }
    let index = (selection % puzzles.len() as u64) as usize;
    Ok((index, &puzzles[index]))
}

// ---------- Chains ----------

static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-\(([A-Za-z0-9_ ]+)\)->").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSegment {
    pub definition: String,
    /// Label of the link leading to the next definition; `None` on the last one.
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    segments: Vec<ChainSegment>,
}

impl Chain {
    /// Splits `def-(label)->def-(label)->def`. No validation: text that does
    /// not match the delimiter stays inside the surrounding definition.
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in LINK.captures_iter(raw) {
            let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            segments.push(ChainSegment {
                definition: raw[last..whole.start()].to_string(),
                link: Some(label.as_str().to_string()),
            });
            last = whole.end();
        }
        segments.push(ChainSegment {
            definition: raw[last..].to_string(),
            link: None,
        });

        Self { segments }
    }

    pub fn segments(&self) -> &[ChainSegment] {
        &self.segments
    }

    /// Definitions and links interleaved, ending on a definition.
    pub fn pieces(&self) -> Vec<&str> {
        self.segments
            .iter()
            .flat_map(|s| std::iter::once(s.definition.as_str()).chain(s.link.as_deref()))
            .collect()
    }

    pub fn links(&self) -> Vec<&str> {
        self.segments.iter().filter_map(|s| s.link.as_deref()).collect()
    }

    /// One word per definition: the text before the first `:`, keeping only
    /// word characters.
    pub fn root_words(&self) -> Vec<String> {
        self.segments
            .iter()
            .map(|s| root_word(&s.definition))
            .collect()
    }
}

fn root_word(definition: &str) -> String {
    let head = definition
        .split_once(':')
        .map_or(definition, |(head, _)| head);
    head.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// The chain currently on display, for the last word that matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainInfo {
    pub word: String,
    pub raw_chain: String,
    pub chain: Chain,
}

impl ChainInfo {
    pub fn new(word: &str, raw_chain: &str) -> Self {
        Self {
            word: word.to_string(),
            raw_chain: raw_chain.to_string(),
            chain: Chain::parse(raw_chain),
        }
    }
}

// ---------- Game state ----------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuessOutcome {
    pub word: String,
    pub accepted: bool,
    /// 0, 50 or 100.
    pub score: u32,
}

impl GuessOutcome {
    pub fn rejected(word: &str) -> Self {
        Self {
            word: word.to_string(),
            accepted: false,
            score: 0,
        }
    }

    pub fn accepted(entry: &WordEntry) -> Self {
        Self {
            word: entry.word.clone(),
            accepted: true,
            score: 100 * u32::from(u8::from(entry.proximity)) / 2,
        }
    }

    pub fn score_percent(&self) -> String {
        format!("{}%", self.score)
    }
}

/// Fisher-Yates: walk down from the last index, swapping each position with a
/// uniformly chosen one at or below it.
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

/// One grid position as a renderer should paint it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell<'a> {
    pub word: &'a str,
    pub class: &'static str,
    pub on_path: bool,
}

pub struct Game {
    loaded: bool,
    puzzle_index: Option<usize>,
    web: HashMap<String, WordEntry>,
    words: Vec<String>,
    ended: bool,
    response: GuessOutcome,
    info: ChainInfo,
}

impl Game {
    pub fn new() -> Self {
        Self {
            loaded: false,
            puzzle_index: None,
            web: HashMap::new(),
            words: Vec::new(),
            ended: false,
            response: GuessOutcome::default(),
            info: ChainInfo::default(),
        }
    }

    /// Loads puzzle `selection % puzzles.len()`, replacing any earlier word
    /// mapping and display order. Returns the index actually used.
    pub fn load<R: Rng + ?Sized>(
        &mut self,
        puzzles: &[Puzzle],
        selection: u64,
        rng: &mut R,
    ) -> Result<usize, Error> {
        let (index, puzzle) = select_puzzle(puzzles, selection)?;

        self.web = puzzle
            .entries()
            .iter()
            .map(|e| (e.word.clone(), e.clone()))
            .collect();
        let mut words: Vec<String> = puzzle
            .entries()
            .iter()
            .map(|e| e.word.clone())
            .unique()
            .collect();
        shuffle(&mut words, rng);
        self.words = words;
        self.puzzle_index = Some(index);
        self.loaded = true;

        debug!(index, words = self.words.len(), "loaded puzzle");
        Ok(index)
    }

    pub fn load_today<R: Rng + ?Sized>(
        &mut self,
        puzzles: &[Puzzle],
        override_index: Option<u64>,
        rng: &mut R,
    ) -> Result<usize, Error> {
        self.load(puzzles, choose_puzzle_index(today(), override_index), rng)
    }

    /// Only the first word found in the puzzle ends the game and sets the
    /// score. Any later match just swaps the chain on display.
    pub fn guess(&mut self, attempt: &str) -> GuessOutcome {
        let entry = match self.web.get(attempt) {
            Some(entry) if self.loaded => entry.clone(),
            _ => {
                let outcome = GuessOutcome::rejected(attempt);
                if !self.ended {
                    self.response = outcome.clone();
                }
                debug!(attempt, "guess not in puzzle");
                return outcome;
            }
        };

        self.info = ChainInfo::new(&entry.word, &entry.chain);
        if !self.ended {
            self.ended = true;
            self.response = GuessOutcome::accepted(&entry);
            info!(word = %entry.word, score = self.response.score, "game ended");
        }
        self.response.clone()
    }

    /// Shareable result, empty until the game has ended.
    pub fn summary_glyphs(&self) -> String {
        if !self.ended {
            return String::new();
        }
        match self.response.score {
            100 => "🟪🕷",
            50 => "🟦🪰",
            _ => "⬜🪰",
        }
        .to_string()
    }

    pub fn cells(&self) -> Vec<Cell<'_>> {
        let path: HashSet<String> = self.info.chain.root_words().into_iter().collect();
        self.words
            .iter()
            .map(|word| {
                let class = match (self.ended, self.web.get(word)) {
                    (true, Some(entry)) => entry.proximity.class(),
                    _ => "unguessed",
                };
                Cell {
                    word: word.as_str(),
                    class,
                    on_path: self.ended && path.contains(word),
                }
            })
            .collect()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn puzzle_index(&self) -> Option<usize> {
        self.puzzle_index
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn entry(&self, word: &str) -> Option<&WordEntry> {
        self.web.get(word)
    }

    pub fn response(&self) -> &GuessOutcome {
        &self.response
    }

    pub fn info(&self) -> &ChainInfo {
        &self.info
    }
}

impl Default for Game {
    fn default() -> Self {
        Self::new()
    }
}
