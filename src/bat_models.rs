// Data model, parsing and fetching for the Chiayi green-line bus arrival feed.
//
// Feed endpoint (Google Apps Script proxy in front of the city bus API):
// - GET {endpoint}?key={routeKey} -> JSON snapshot:
//   { "time": "HH:MM:SS", "data": [ {sid, na, ena, lat, lon, sequence, ptime, car, alert}, ... ],
//     "stop": [ {sid, addr}, ... ] }
//
// The wire format is type-sloppy (numbers arrive as strings, booleans as 0/1),
// so everything is pulled out of serde_json::Value with per-field fallbacks.

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use reqwest::blocking;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ============================================================================
// Route Configuration
// ============================================================================

pub const DEFAULT_ENDPOINT: &str =
    "https://script.google.com/macros/s/AKfycbxXoVIhhQFmVIkXV1KTCwXi0pA/exec";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub label: String,
    pub key: String,
}

impl Route {
    fn new(id: &str, label: &str, key: &str) -> Self {
        Route {
            id: id.to_string(),
            label: label.to_string(),
            key: key.to_string(),
        }
    }
}

lazy_static! {
    pub static ref ROUTES: Vec<Route> = vec![
        Route::new("r1", "綠線(往嘉義大學)", "071401"),
        Route::new("r2", "綠線(往大富路)", "071402"),
        Route::new("r3", "綠A線(往嘉義大學)", "0714A1"),
        Route::new("r4", "綠A線(往二二八公園)", "0714A2"),
    ];
}

pub fn route_by_id(id: &str) -> Option<&'static Route> {
    ROUTES.iter().find(|r| r.id == id)
}

pub fn default_route() -> &'static Route {
    &ROUTES[0]
}

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStop {
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub na: String,
    #[serde(default)]
    pub ena: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub sequence: Option<f64>,
    #[serde(default)]
    pub ptime: Option<String>,
    #[serde(default)]
    pub car: bool,
    #[serde(default)]
    pub alert: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressEntry {
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub addr: String,
}

// One fetched batch of stop/arrival data, immutable once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub data: Vec<RawStop>,
    #[serde(default)]
    pub stop: Vec<AddressEntry>,
    #[serde(default)]
    pub offline: bool,
}

impl Snapshot {
    pub fn from_value(json: &Value) -> Self {
        let data = json["data"]
            .as_array()
            .map(|arr| arr.iter().map(RawStop::from_value).collect())
            .unwrap_or_default();
        let stop = json["stop"]
            .as_array()
            .map(|arr| arr.iter().map(AddressEntry::from_value).collect())
            .unwrap_or_default();

        Snapshot {
            time: json["time"].as_str().map(String::from),
            data,
            stop,
            offline: json.get("offline").map(val_bool).unwrap_or(false),
        }
    }

    // Synthetic payload shown when the network and both cache tiers come
    // up empty. Renders as a placeholder, never as an error.
    pub fn offline_placeholder() -> Self {
        Snapshot {
            offline: true,
            ..Default::default()
        }
    }
}

impl RawStop {
    fn from_value(v: &Value) -> Self {
        RawStop {
            sid: v.get("sid").and_then(val_str).unwrap_or_default(),
            na: v.get("na").and_then(val_str).unwrap_or_default(),
            ena: v.get("ena").and_then(val_str).unwrap_or_default(),
            lat: v.get("lat").and_then(val_f64),
            lon: v.get("lon").and_then(val_f64),
            sequence: v.get("sequence").and_then(val_f64),
            ptime: v.get("ptime").and_then(val_str),
            car: v.get("car").map(val_bool).unwrap_or(false),
            alert: v.get("alert").and_then(val_str),
        }
    }
}

impl AddressEntry {
    fn from_value(v: &Value) -> Self {
        AddressEntry {
            sid: v.get("sid").and_then(val_str).unwrap_or_default(),
            addr: v.get("addr").and_then(val_str).unwrap_or_default(),
        }
    }
}

fn val_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn val_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn val_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0" && s != "false",
        _ => false,
    }
}

// ============================================================================
// Time Parsing
// ============================================================================

// Feed sentinels: at the platform, imminent, and the countdown unit
// marker ("5分").
pub const ARRIVING_NOW: &str = "進站";
pub const IMMINENT: &str = "即將";
pub const MINUTES_SUFFIX: char = '分';

lazy_static! {
    static ref HHMM_RE: Regex = Regex::new(r"^(\d{2}):(\d{2})").unwrap();
}

/// Minutes until arrival. Empty text is None, the arriving-now sentinel is
/// 0, "N分" is N (non-numeric prefix degrades to 0), and an "HH:MM" prefix
/// is diffed against the server time-of-day with a +24h midnight rollover.
pub fn eta_minutes(server_time: Option<&str>, arrival: Option<&str>) -> Option<i64> {
    let text = arrival?;
    if text.is_empty() {
        return None;
    }
    if text.contains(ARRIVING_NOW) {
        return Some(0);
    }
    if text.ends_with(MINUTES_SUFFIX) {
        return Some(leading_int(text).unwrap_or(0));
    }
    if let Some(caps) = HHMM_RE.captures(text) {
        let target = caps[1].parse::<i64>().unwrap_or(0) * 60 + caps[2].parse::<i64>().unwrap_or(0);
        let now = time_of_day_minutes(server_time.unwrap_or("00:00:00"));
        let mut diff = target - now;
        if diff < 0 {
            diff += 24 * 60;
        }
        return Some(diff);
    }
    None
}

fn leading_int(text: &str) -> Option<i64> {
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn time_of_day_minutes(hhmmss: &str) -> i64 {
    let mut parts = hhmmss.split(':');
    let hours: i64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minutes: i64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    hours * 60 + minutes
}

// Left-hand time cell: the "HH:MM" prefix if present, else the raw text,
// else a placeholder dash.
pub fn time_cell(arrival: Option<&str>) -> String {
    match arrival {
        Some(text) if !text.is_empty() => HHMM_RE
            .find(text)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| text.to_string()),
        _ => "—".to_string(),
    }
}

// ============================================================================
// Geodesic Distance
// ============================================================================

pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Haversine distance. A missing point yields infinity so unknown
/// distances sort last.
pub fn distance_km(a: Option<GeoPoint>, b: Option<GeoPoint>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return f64::INFINITY;
    };
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let x = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * x.sqrt().asin()
}

// ============================================================================
// Status Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalStatus {
    Dim,
    Active,
    Upcoming,
    Delayed,
}

/// Maps arrival text to the row's visual/semantic state. Countdown text uses
/// a 1-minute threshold for Active and 3 minutes for Upcoming; countdown text
/// without a leading number falls through to Delayed.
pub fn classify(arrival: Option<&str>) -> ArrivalStatus {
    let text = match arrival {
        Some(t) if !t.is_empty() => t,
        _ => return ArrivalStatus::Dim,
    };
    if text.contains(ARRIVING_NOW) || text.contains(IMMINENT) {
        return ArrivalStatus::Active;
    }
    if text.ends_with(MINUTES_SUFFIX) {
        return match leading_int(text) {
            Some(n) if n <= 1 => ArrivalStatus::Active,
            Some(n) if n <= 3 => ArrivalStatus::Upcoming,
            _ => ArrivalStatus::Delayed,
        };
    }
    ArrivalStatus::Dim
}

// ============================================================================
// Snapshot Processing
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RenderFilters {
    pub keyword: String,
    pub only_active: bool,
    pub nearby_first: bool,
    pub user_loc: Option<GeoPoint>,
}

// One station as displayed, built fresh on every render pass.
#[derive(Debug, Clone)]
pub struct DisplayRow {
    pub sid: String,
    pub name: String,
    pub alt_name: String,
    pub addr: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub sequence: f64,
    pub arrival_text: Option<String>,
    pub has_vehicle: bool,
    pub eta_min: Option<i64>,
    pub dist_km: f64,
    pub status: ArrivalStatus,
}

/// Transforms a snapshot into the ordered row list ready for rendering:
/// address join, ETA/distance derivation, keyword and only-active filters,
/// sequence or distance ordering, then first-wins dedup by normalized name.
pub fn process(snapshot: &Snapshot, filters: &RenderFilters) -> Vec<DisplayRow> {
    let addr_map: HashMap<&str, &str> = snapshot
        .stop
        .iter()
        .map(|e| (e.sid.as_str(), e.addr.as_str()))
        .collect();

    let keyword = filters.keyword.trim().to_lowercase();
    let server_time = snapshot.time.as_deref();

    let mut rows: Vec<DisplayRow> = snapshot
        .data
        .iter()
        .map(|s| {
            let point = match (s.lat, s.lon) {
                (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
                _ => None,
            };
            DisplayRow {
                sid: s.sid.clone(),
                name: s.na.clone(),
                alt_name: s.ena.clone(),
                addr: addr_map
                    .get(s.sid.as_str())
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                lat: s.lat,
                lon: s.lon,
                // Missing sequence sorts last, deterministically.
                sequence: s.sequence.unwrap_or(f64::MAX),
                arrival_text: s.ptime.clone(),
                has_vehicle: s.car,
                eta_min: eta_minutes(server_time, s.ptime.as_deref()),
                dist_km: distance_km(filters.user_loc, point),
                status: classify(s.ptime.as_deref()),
            }
        })
        .filter(|row| {
            if !keyword.is_empty() {
                let haystack = format!("{}{}", row.name, row.alt_name).to_lowercase();
                if !haystack.contains(&keyword) {
                    return false;
                }
            }
            if filters.only_active && !has_live_activity(row) {
                return false;
            }
            true
        })
        .collect();

    if filters.nearby_first && filters.user_loc.is_some() {
        rows.sort_by(|a, b| a.dist_km.total_cmp(&b.dist_km));
    } else {
        rows.sort_by(|a, b| a.sequence.total_cmp(&b.sequence));
    }

    // Same-name stations keep only the first surviving row. Unnamed rows are
    // never deduplicated against each other.
    let mut seen = HashSet::new();
    rows.retain(|row| {
        let key = row.name.trim().to_lowercase();
        if key.is_empty() {
            return true;
        }
        seen.insert(key)
    });

    rows
}

// Countdown or arriving-now text, or a vehicle currently present.
fn has_live_activity(row: &DisplayRow) -> bool {
    let live_text = row
        .arrival_text
        .as_deref()
        .map(|t| t.contains(MINUTES_SUFFIX) || t.contains(ARRIVING_NOW))
        .unwrap_or(false);
    live_text || row.has_vehicle
}

/// First non-empty alert across all raw stops (pre-filter), whitespace
/// collapsed.
pub fn global_alert(snapshot: &Snapshot) -> Option<String> {
    snapshot
        .data
        .iter()
        .filter_map(|s| s.alert.as_deref())
        .find(|a| !a.trim().is_empty())
        .map(|a| a.split_whitespace().collect::<Vec<_>>().join(" "))
}

// First Active row, else the first Upcoming one.
pub fn autoscroll_target(rows: &[DisplayRow]) -> Option<usize> {
    rows.iter()
        .position(|r| r.status == ArrivalStatus::Active)
        .or_else(|| rows.iter().position(|r| r.status == ArrivalStatus::Upcoming))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum BatError {
    Network(String),
    Cancelled,
    Parse(String),
    File(String),
    EmptyCache,
}

impl std::fmt::Display for BatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatError::Network(e) => write!(f, "Network error: {}", e),
            BatError::Cancelled => write!(f, "Fetch superseded by a newer request"),
            BatError::Parse(e) => write!(f, "Parse error: {}", e),
            BatError::File(e) => write!(f, "File error: {}", e),
            BatError::EmptyCache => write!(f, "No cached snapshot available"),
        }
    }
}

impl std::error::Error for BatError {}

pub type Result<T> = std::result::Result<T, BatError>;

// ============================================================================
// Cancellation
// ============================================================================

// Shared cancellation flag for an in-flight fetch, observed at I/O
// boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Data Fetching
// ============================================================================

#[derive(Clone)]
pub struct DataFetcher {
    client: blocking::Client,
    endpoint: String,
}

impl DataFetcher {
    const REQUEST_TIMEOUT_SECS: u64 = 15;

    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = blocking::Client::builder()
            .timeout(Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BatError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(DataFetcher {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn fetch(&self, route: &Route, token: &CancelToken) -> Result<Snapshot> {
        if token.is_cancelled() {
            return Err(BatError::Cancelled);
        }

        let url = format!("{}?key={}", self.endpoint, route.key);
        let response = self.client.get(&url).send().map_err(|e| {
            if token.is_cancelled() {
                BatError::Cancelled
            } else {
                BatError::Network(format!(
                    "Failed to fetch snapshot: {}. Check your internet connection.",
                    e
                ))
            }
        })?;

        if token.is_cancelled() {
            return Err(BatError::Cancelled);
        }
        if !response.status().is_success() {
            return Err(BatError::Network(format!(
                "API returned error: {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .map_err(|e| BatError::Network(format!("Failed to read response: {}", e)))?;
        if token.is_cancelled() {
            return Err(BatError::Cancelled);
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| BatError::Parse(format!("Invalid JSON response: {}", e)))?;
        Ok(Snapshot::from_value(&json))
    }
}

// ============================================================================
// Offline Cache (two tiers)
// ============================================================================

// A "latest snapshot" slot: the volatile session tier and the durable
// on-disk tier, composed by the controller.
pub trait SnapshotStore {
    fn get(&self) -> Option<Snapshot>;
    fn set(&mut self, snapshot: &Snapshot) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Option<Snapshot>,
}

impl SnapshotStore for MemoryStore {
    fn get(&self) -> Option<Snapshot> {
        self.slot.clone()
    }

    fn set(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.slot = Some(snapshot.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.slot = None;
        Ok(())
    }
}

// Holds the last successful snapshot and the selected route id under the
// platform cache directory, written via temp file rename.
#[derive(Debug)]
pub struct DurableStore {
    dir: PathBuf,
}

impl DurableStore {
    pub fn open_default() -> Self {
        let mut dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        dir.push("bat");
        fs::create_dir_all(&dir).ok();
        DurableStore { dir }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        fs::create_dir_all(&dir).ok();
        DurableStore { dir }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("last_snapshot.json")
    }

    fn route_path(&self) -> PathBuf {
        self.dir.join("selected_route")
    }

    fn write_atomic(&self, path: &PathBuf, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| BatError::File(format!("Failed to create temp file: {}", e)))?;
        tmp.write_all(bytes)
            .map_err(|e| BatError::File(format!("Failed to write {}: {}", path.display(), e)))?;
        tmp.persist(path)
            .map_err(|e| BatError::File(format!("Failed to persist {}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn load_route_id(&self) -> Option<String> {
        fs::read_to_string(self.route_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn save_route_id(&self, id: &str) -> Result<()> {
        self.write_atomic(&self.route_path(), id.as_bytes())
    }

    pub fn fallback(&self) -> Result<Snapshot> {
        self.get().ok_or(BatError::EmptyCache)
    }
}

impl SnapshotStore for DurableStore {
    fn get(&self) -> Option<Snapshot> {
        let path = self.snapshot_path();
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Snapshot>(&contents) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Failed to parse cached snapshot ({}), ignoring it", e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read cached snapshot ({}), ignoring it", e);
                None
            }
        }
    }

    fn set(&mut self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| BatError::File(format!("Failed to serialize snapshot: {}", e)))?;
        self.write_atomic(&self.snapshot_path(), json.as_bytes())?;
        info!("Cached snapshot saved to {:?}", self.snapshot_path());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let path = self.snapshot_path();
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| BatError::File(format!("Failed to remove {}: {}", path.display(), e)))?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
