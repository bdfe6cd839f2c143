//! Shared state behind every simulated object.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use super::connection::Sinks;
use super::{SimEvent, lock};
use crate::com::vtables::{IOPCDataCallback, IOPCShutdown};
use crate::com::{Guid, StatusCode};
use crate::records::{AccessRights, DataSource, Quality};
use crate::variant::{ArrayValue, FileTime, Value, VarType, datetime_to_filetime};

pub(crate) const LOCALE_ENGLISH: u32 = 0x0409;
pub(crate) const LOCALE_GERMAN: u32 = 0x0407;
/// Fastest update rate the simulator grants.
pub(crate) const MIN_UPDATE_RATE: u32 = 100;

/// Rates are granted in steps of the minimum rate; zero asks for the fastest.
pub(crate) fn revise_update_rate(requested: u32) -> u32 {
    requested.max(MIN_UPDATE_RATE).div_ceil(MIN_UPDATE_RATE) * MIN_UPDATE_RATE
}

pub(crate) fn now() -> FileTime {
    datetime_to_filetime(&Utc::now())
}

#[derive(Debug, Clone)]
pub(crate) struct SimTag {
    pub(crate) value: Value,
    pub(crate) quality: Quality,
    pub(crate) timestamp: FileTime,
    pub(crate) rights: AccessRights,
}

impl SimTag {
    fn new(value: Value, rights: AccessRights) -> Self {
        Self {
            value,
            quality: Quality::GOOD,
            timestamp: now(),
            rights,
        }
    }

    pub(crate) fn set(&mut self, value: Value) {
        self.value = value;
        self.quality = Quality::GOOD;
        self.timestamp = now();
    }

    pub(crate) fn canonical_type(&self) -> VarType {
        self.value.var_type()
    }
}

/// One sample of a tag, converted to the item's requested type.
pub(crate) struct Sample {
    pub(crate) value: Value,
    pub(crate) quality: Quality,
    pub(crate) timestamp: FileTime,
}

pub(crate) struct SimItem {
    pub(crate) item_id: String,
    pub(crate) client_handle: u32,
    pub(crate) active: bool,
    pub(crate) requested_type: VarType,
}

pub(crate) struct GroupData {
    pub(crate) name: String,
    pub(crate) active: bool,
    pub(crate) update_rate: u32,
    pub(crate) time_bias: i32,
    pub(crate) deadband: f32,
    pub(crate) locale_id: u32,
    pub(crate) client_handle: u32,
    pub(crate) enabled: bool,
    pub(crate) items: BTreeMap<u32, SimItem>,
}

pub(crate) struct SimGroup {
    pub(crate) server_handle: u32,
    pub(crate) data: Mutex<GroupData>,
    pub(crate) sinks: Sinks<IOPCDataCallback>,
    /// Live group objects handed to the client.
    pub(crate) facets: AtomicUsize,
    /// Async requests not yet completed, by cancel id.
    pub(crate) pending: Mutex<HashSet<u32>>,
}

impl SimGroup {
    pub(crate) fn name(&self) -> String {
        lock(&self.data).name.clone()
    }

    pub(crate) fn client_handle(&self) -> u32 {
        lock(&self.data).client_handle
    }
}

pub(crate) struct SimState {
    pub(crate) tags: Mutex<BTreeMap<String, SimTag>>,
    pub(crate) groups: Mutex<BTreeMap<u32, Arc<SimGroup>>>,
    next_group: AtomicU32,
    next_item: AtomicU32,
    next_cancel: AtomicU32,
    pub(crate) locale_id: AtomicU32,
    pub(crate) client_name: Mutex<Option<String>>,
    pub(crate) browse_path: Mutex<Vec<String>>,
    pub(crate) shutdown_sinks: Sinks<IOPCShutdown>,
    pub(crate) refused: Mutex<Vec<Guid>>,
    pub(crate) async_delay: Mutex<Duration>,
    pub(crate) live: AtomicUsize,
    pub(crate) over_releases: AtomicUsize,
    pub(crate) events: Mutex<Vec<SimEvent>>,
    pub(crate) start_time: FileTime,
}

impl Default for SimState {
    fn default() -> Self {
        let state = Self {
            tags: Mutex::new(BTreeMap::new()),
            groups: Mutex::new(BTreeMap::new()),
            next_group: AtomicU32::new(1),
            next_item: AtomicU32::new(1),
            next_cancel: AtomicU32::new(1),
            locale_id: AtomicU32::new(LOCALE_ENGLISH),
            client_name: Mutex::new(None),
            browse_path: Mutex::new(Vec::new()),
            shutdown_sinks: Sinks::default(),
            refused: Mutex::new(Vec::new()),
            async_delay: Mutex::new(Duration::ZERO),
            live: AtomicUsize::new(0),
            over_releases: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            start_time: now(),
        };
        for (id, value, rights) in default_tags() {
            state.insert_tag(id, value, rights);
        }
        state
    }
}

fn default_tags() -> Vec<(&'static str, Value, AccessRights)> {
    vec![
        ("Simulation.Counter", Value::I32(0), AccessRights::READ_WRITE),
        ("Simulation.Ramp", Value::F64(0.0), AccessRights::READABLE),
        ("Simulation.Flag", Value::Bool(false), AccessRights::READ_WRITE),
        ("Simulation.Text", Value::String("hello".into()), AccessRights::READ_WRITE),
        ("Simulation.Setpoint", Value::F32(0.0), AccessRights::WRITEABLE),
        ("Plant.Line1.Speed", Value::F32(12.5), AccessRights::READ_WRITE),
        ("Plant.Line1.Status", Value::U16(1), AccessRights::READABLE),
        ("Plant.Line2.Speed", Value::F32(0.0), AccessRights::READ_WRITE),
        ("Plant.Line2.Status", Value::U16(0), AccessRights::READABLE),
        (
            "Arrays.Int32",
            Value::Array(ArrayValue::I32(vec![1, 2, 3])),
            AccessRights::READ_WRITE,
        ),
        ("X.Y", Value::I32(0), AccessRights::READ_WRITE),
    ]
}

impl SimState {
    pub(crate) fn log(&self, event: SimEvent) {
        tracing::trace!(?event, "simulator event");
        lock(&self.events).push(event);
    }

    pub(crate) fn is_refused(&self, iid: &Guid) -> bool {
        lock(&self.refused).contains(iid)
    }

    pub(crate) fn async_delay(&self) -> Duration {
        *lock(&self.async_delay)
    }

    pub(crate) fn next_item_handle(&self) -> u32 {
        self.next_item.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_cancel_id(&self) -> u32 {
        self.next_cancel.fetch_add(1, Ordering::Relaxed)
    }

    // ── Tags ──────────────────────────────────────────────────────

    pub(crate) fn insert_tag(&self, item_id: &str, value: Value, rights: AccessRights) {
        lock(&self.tags).insert(item_id.to_string(), SimTag::new(value, rights));
    }

    pub(crate) fn update_tag(&self, item_id: &str, f: impl FnOnce(&mut SimTag)) -> bool {
        match lock(&self.tags).get_mut(item_id) {
            Some(tag) => {
                f(tag);
                true
            }
            None => false,
        }
    }

    pub(crate) fn tag_value(&self, item_id: &str) -> Option<Value> {
        lock(&self.tags).get(item_id).map(|t| t.value.clone())
    }

    pub(crate) fn tag(&self, item_id: &str) -> Option<SimTag> {
        lock(&self.tags).get(item_id).cloned()
    }

    /// Validates an item definition against the address space.
    ///
    /// # Returns
    /// The tag's canonical type and access rights
    pub(crate) fn validate_item(
        &self,
        item_id: &str,
        access_path: &str,
        requested_type: VarType,
    ) -> Result<(VarType, AccessRights), StatusCode> {
        if item_id.trim().is_empty() {
            return Err(StatusCode::OPC_E_INVALIDITEMID);
        }
        let tag = self.tag(item_id).ok_or(StatusCode::OPC_E_UNKNOWNITEMID)?;
        if !access_path.is_empty() {
            return Err(StatusCode::OPC_E_UNKNOWNPATH);
        }
        let canonical = tag.canonical_type();
        if !is_convertible(canonical, requested_type) {
            return Err(StatusCode::OPC_E_BADTYPE);
        }
        Ok((canonical, tag.rights))
    }

    /// Reads a tag. A device read refreshes its timestamp.
    pub(crate) fn sample(
        &self,
        item_id: &str,
        source: DataSource,
        requested_type: VarType,
    ) -> Result<Sample, StatusCode> {
        let mut tags = lock(&self.tags);
        let tag = tags.get_mut(item_id).ok_or(StatusCode::OPC_E_UNKNOWNITEMID)?;
        if !tag.rights.is_readable() {
            return Err(StatusCode::OPC_E_BADRIGHTS);
        }
        if source == DataSource::Device {
            tag.timestamp = now();
        }
        Ok(Sample {
            value: coerce(&tag.value, requested_type)?,
            quality: tag.quality,
            timestamp: tag.timestamp,
        })
    }

    /// Writes a tag, converting to its canonical type.
    pub(crate) fn write(&self, item_id: &str, value: &Value) -> Result<(), StatusCode> {
        let mut tags = lock(&self.tags);
        let tag = tags.get_mut(item_id).ok_or(StatusCode::OPC_E_UNKNOWNITEMID)?;
        if !tag.rights.is_writable() {
            return Err(StatusCode::OPC_E_BADRIGHTS);
        }
        let converted = coerce(value, tag.canonical_type())?;
        tag.set(converted);
        Ok(())
    }

    // ── Groups ────────────────────────────────────────────────────

    /// Registers a new group.
    ///
    /// # Errors
    /// `OPC_E_DUPLICATENAME` when the name is taken.
    pub(crate) fn add_group(&self, mut data: GroupData) -> Result<Arc<SimGroup>, StatusCode> {
        let mut groups = lock(&self.groups);
        let server_handle = self.next_group.fetch_add(1, Ordering::Relaxed);
        if data.name.is_empty() {
            data.name = format!("Group{server_handle}");
        }
        if groups.values().any(|g| g.name() == data.name) {
            return Err(StatusCode::OPC_E_DUPLICATENAME);
        }
        let name = data.name.clone();
        let group = Arc::new(SimGroup {
            server_handle,
            data: Mutex::new(data),
            sinks: Sinks::default(),
            facets: AtomicUsize::new(0),
            pending: Mutex::new(HashSet::new()),
        });
        groups.insert(server_handle, Arc::clone(&group));
        drop(groups);
        self.log(SimEvent::GroupAdded { server_handle, name });
        Ok(group)
    }

    pub(crate) fn group_by_name(&self, name: &str) -> Option<Arc<SimGroup>> {
        lock(&self.groups).values().find(|g| g.name() == name).cloned()
    }

    pub(crate) fn is_name_taken(&self, name: &str, except: u32) -> bool {
        lock(&self.groups)
            .values()
            .any(|g| g.server_handle != except && g.name() == name)
    }

    pub(crate) fn remove_group(&self, server_handle: u32) -> Option<Arc<SimGroup>> {
        lock(&self.groups).remove(&server_handle)
    }

    pub(crate) fn group_snapshot(&self) -> Vec<Arc<SimGroup>> {
        lock(&self.groups).values().cloned().collect()
    }

    // ── Browsing ──────────────────────────────────────────────────

    /// Branch names directly below `path`.
    pub(crate) fn branches(&self, path: &[String]) -> BTreeSet<String> {
        lock(&self.tags)
            .keys()
            .filter_map(|id| {
                let segments: Vec<&str> = id.split('.').collect();
                (segments.len() > path.len() + 1 && starts_with(&segments, path))
                    .then(|| segments[path.len()].to_string())
            })
            .collect()
    }

    /// Leaf names directly below `path` with their tags.
    pub(crate) fn leaves(&self, path: &[String]) -> Vec<(String, SimTag)> {
        lock(&self.tags)
            .iter()
            .filter_map(|(id, tag)| {
                let segments: Vec<&str> = id.split('.').collect();
                (segments.len() == path.len() + 1 && starts_with(&segments, path))
                    .then(|| (segments[path.len()].to_string(), tag.clone()))
            })
            .collect()
    }

    /// Every item id below `path`.
    pub(crate) fn flat(&self, path: &[String]) -> Vec<(String, SimTag)> {
        lock(&self.tags)
            .iter()
            .filter(|(id, _)| {
                let segments: Vec<&str> = id.split('.').collect();
                segments.len() > path.len() && starts_with(&segments, path)
            })
            .map(|(id, tag)| (id.clone(), tag.clone()))
            .collect()
    }

    pub(crate) fn is_branch(&self, path: &[String]) -> bool {
        match path.split_last() {
            None => true,
            Some((last, parent)) => self.branches(parent).contains(last),
        }
    }
}

fn starts_with(segments: &[&str], path: &[String]) -> bool {
    path.iter().zip(segments).all(|(p, s)| p == s)
}

/// `*` wildcard matching; an empty filter matches everything.
pub(crate) fn matches_filter(name: &str, filter: &str) -> bool {
    if filter.is_empty() || filter == "*" {
        return true;
    }
    let parts: Vec<&str> = filter.split('*').collect();
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    let Some(mut remaining) = name.strip_prefix(first) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part) {
            Some(at) => remaining = &remaining[at + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}

fn is_scalar_target(vt: VarType) -> bool {
    matches!(
        vt,
        VarType::I1
            | VarType::UI1
            | VarType::I2
            | VarType::UI2
            | VarType::I4
            | VarType::UI4
            | VarType::I8
            | VarType::UI8
            | VarType::R4
            | VarType::R8
            | VarType::BOOL
            | VarType::BSTR
    )
}

/// Whether items of `canonical` type can be served as `requested`.
pub(crate) fn is_convertible(canonical: VarType, requested: VarType) -> bool {
    requested == VarType::EMPTY
        || requested == canonical
        || (!canonical.is_array() && canonical != VarType::DATE && is_scalar_target(requested))
}

/// Converts `value` to `target`; `VT_EMPTY` keeps the value as is.
///
/// # Errors
/// `OPC_E_BADTYPE` for unsupported conversions, `OPC_E_RANGE` when the
/// value does not fit and `DISP_E_TYPEMISMATCH` for unparsable text.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub(crate) fn coerce(value: &Value, target: VarType) -> Result<Value, StatusCode> {
    fn fit(number: f64, min: f64, max: f64) -> Result<f64, StatusCode> {
        let rounded = number.round();
        if rounded.is_finite() && rounded >= min && rounded <= max {
            Ok(rounded)
        } else {
            Err(StatusCode::OPC_E_RANGE)
        }
    }

    if target == VarType::EMPTY || value.var_type() == target {
        return Ok(value.clone());
    }
    if !is_scalar_target(target) {
        return Err(StatusCode::OPC_E_BADTYPE);
    }
    let number = match value {
        Value::I8(v) => f64::from(*v),
        Value::U8(v) => f64::from(*v),
        Value::I16(v) => f64::from(*v),
        Value::U16(v) => f64::from(*v),
        Value::I32(v) => f64::from(*v),
        Value::U32(v) => f64::from(*v),
        Value::I64(v) => *v as f64,
        Value::U64(v) => *v as f64,
        Value::F32(v) => f64::from(*v),
        Value::F64(v) => *v,
        Value::Bool(v) => f64::from(u8::from(*v)),
        Value::String(text) if target == VarType::BOOL => {
            return Value::parse_as(text, target).map_err(|_| StatusCode::DISP_E_TYPEMISMATCH);
        }
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| StatusCode::DISP_E_TYPEMISMATCH)?,
        Value::Empty | Value::Date(_) | Value::Array(_) => return Err(StatusCode::OPC_E_BADTYPE),
    };
    if target == VarType::BSTR {
        return Ok(Value::String(value.to_string()));
    }

    let converted = match target {
        VarType::I1 => Value::I8(fit(number, f64::from(i8::MIN), f64::from(i8::MAX))? as i8),
        VarType::UI1 => Value::U8(fit(number, 0.0, f64::from(u8::MAX))? as u8),
        VarType::I2 => Value::I16(fit(number, f64::from(i16::MIN), f64::from(i16::MAX))? as i16),
        VarType::UI2 => Value::U16(fit(number, 0.0, f64::from(u16::MAX))? as u16),
        VarType::I4 => Value::I32(fit(number, f64::from(i32::MIN), f64::from(i32::MAX))? as i32),
        VarType::UI4 => Value::U32(fit(number, 0.0, f64::from(u32::MAX))? as u32),
        VarType::I8 => Value::I64(fit(number, i64::MIN as f64, i64::MAX as f64)? as i64),
        VarType::UI8 => Value::U64(fit(number, 0.0, u64::MAX as f64)? as u64),
        VarType::R4 => {
            if number.is_finite() && number.abs() > f64::from(f32::MAX) {
                return Err(StatusCode::OPC_E_RANGE);
            }
            Value::F32(number as f32)
        }
        VarType::R8 => Value::F64(number),
        VarType::BOOL => Value::Bool(number != 0.0),
        _ => return Err(StatusCode::OPC_E_BADTYPE),
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &[&str]) -> Vec<String> {
        p.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_update_rate_revision() {
        assert_eq!(revise_update_rate(0), 100);
        assert_eq!(revise_update_rate(1000), 1000);
        assert_eq!(revise_update_rate(250), 300);
    }

    #[test]
    fn test_coerce_numeric_conversions() {
        assert_eq!(coerce(&Value::I32(42), VarType::R8), Ok(Value::F64(42.0)));
        assert_eq!(coerce(&Value::F64(2.6), VarType::I2), Ok(Value::I16(3)));
        assert_eq!(coerce(&Value::I32(300), VarType::UI1), Err(StatusCode::OPC_E_RANGE));
        assert_eq!(coerce(&Value::I32(1), VarType::BOOL), Ok(Value::Bool(true)));
        assert_eq!(coerce(&Value::String(" 7 ".into()), VarType::I4), Ok(Value::I32(7)));
        assert_eq!(
            coerce(&Value::String("abc".into()), VarType::I4),
            Err(StatusCode::DISP_E_TYPEMISMATCH)
        );
        assert_eq!(coerce(&Value::U16(5), VarType::BSTR), Ok(Value::String("5".into())));
    }

    #[test]
    fn test_coerce_rejects_arrays_to_scalars() {
        let array = Value::Array(ArrayValue::I32(vec![1]));
        assert_eq!(coerce(&array, VarType::I4), Err(StatusCode::OPC_E_BADTYPE));
        assert_eq!(coerce(&array, VarType::EMPTY), Ok(array));
    }

    #[test]
    fn test_filter_wildcards() {
        assert!(matches_filter("Speed", ""));
        assert!(matches_filter("Speed", "*"));
        assert!(matches_filter("Speed", "Sp*"));
        assert!(matches_filter("Speed", "*eed"));
        assert!(matches_filter("Speed", "S*e*d"));
        assert!(!matches_filter("Status", "Sp*"));
        assert!(!matches_filter("Speed", "Speed2"));
        assert!(matches_filter("Speed", "Speed"));
    }

    #[test]
    fn test_address_space_tree() {
        let state = SimState::default();
        let root = state.branches(&[]);
        assert!(root.contains("Plant"));
        assert!(root.contains("Simulation"));
        assert!(!root.contains("X.Y"));

        let line1 = path(&["Plant", "Line1"]);
        let leaves: Vec<String> = state.leaves(&line1).into_iter().map(|(n, _)| n).collect();
        assert_eq!(leaves, vec!["Speed", "Status"]);
        assert!(state.is_branch(&line1));
        assert!(!state.is_branch(&path(&["Plant", "Line9"])));
        assert_eq!(state.flat(&path(&["Plant"])).len(), 4);
    }

    #[test]
    fn test_validate_item() {
        let state = SimState::default();
        assert_eq!(
            state.validate_item("Simulation.Counter", "", VarType::EMPTY),
            Ok((VarType::I4, AccessRights::READ_WRITE))
        );
        assert_eq!(
            state.validate_item("Nope", "", VarType::EMPTY),
            Err(StatusCode::OPC_E_UNKNOWNITEMID)
        );
        assert_eq!(
            state.validate_item("", "", VarType::EMPTY),
            Err(StatusCode::OPC_E_INVALIDITEMID)
        );
        assert_eq!(
            state.validate_item("Arrays.Int32", "", VarType::I4),
            Err(StatusCode::OPC_E_BADTYPE)
        );
    }

    #[test]
    fn test_write_respects_rights_and_type() {
        let state = SimState::default();
        assert_eq!(
            state.write("Plant.Line1.Status", &Value::U16(2)),
            Err(StatusCode::OPC_E_BADRIGHTS)
        );
        state.write("Simulation.Counter", &Value::F64(41.6)).unwrap();
        assert_eq!(state.tag_value("Simulation.Counter"), Some(Value::I32(42)));
    }

    #[test]
    fn test_duplicate_group_name_is_refused() {
        let state = SimState::default();
        let data = || GroupData {
            name: "A".into(),
            active: true,
            update_rate: 1000,
            time_bias: 0,
            deadband: 0.0,
            locale_id: 0,
            client_handle: 1,
            enabled: true,
            items: BTreeMap::new(),
        };
        state.add_group(data()).unwrap();
        assert!(matches!(state.add_group(data()), Err(StatusCode::OPC_E_DUPLICATENAME)));
    }
}
