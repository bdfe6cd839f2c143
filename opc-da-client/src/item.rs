//! A single item of a group, for callers that work one tag at a time.
//!
//! [`OpcItem`] is a view: it holds the group and the item's server handle
//! and reads everything else from the group's record table, so it never
//! goes stale after a client handle or data type change. Every call is a
//! one-element bulk call whose per-item failure becomes the top-level error.

use std::sync::Arc;

use crate::errors::{ItemError, OpcError, OpcResult};
use crate::group::{GroupInner, OpcGroup};
use crate::items::{ItemRecord, OpcItems};
use crate::records::{AccessRights, DataSource, ItemHandle, ItemValue};
use crate::variant::{ArrayValue, Value, VarType};

/// Property holding the engineering-unit kind.
const PROPERTY_EU_TYPE: u32 = 7;
/// Property holding the engineering-unit details.
const PROPERTY_EU_INFO: u32 = 8;

/// Kind of engineering units an item reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EuType {
    NoUnits,
    Analog,
    Enumerated,
    /// A vendor-specific kind.
    Other(i32),
}

impl From<i32> for EuType {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::NoUnits,
            1 => Self::Analog,
            2 => Self::Enumerated,
            other => Self::Other(other),
        }
    }
}

/// Engineering units of an item.
#[derive(Debug, Clone, PartialEq)]
pub enum EuInfo {
    NoUnits,
    /// Expected value range.
    Analog { low: f64, high: f64 },
    /// Text for each value, starting at zero.
    Enumerated(Vec<String>),
    /// Units of a vendor-specific kind, passed through undecoded.
    Other { eu_type: i32, info: Value },
}

/// One item of a group.
#[derive(Clone)]
pub struct OpcItem {
    group: Arc<GroupInner>,
    server_handle: ItemHandle,
}

impl std::fmt::Debug for OpcItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcItem")
            .field("group", &self.group.name())
            .field("server_handle", &self.server_handle)
            .finish()
    }
}

impl OpcItem {
    pub(crate) fn new(group: Arc<GroupInner>, server_handle: ItemHandle) -> Self {
        Self {
            group,
            server_handle,
        }
    }

    pub fn server_handle(&self) -> ItemHandle {
        self.server_handle
    }

    /// The item's current record.
    ///
    /// # Errors
    /// `NotFound` once the item has been removed from the group.
    pub fn record(&self) -> OpcResult<ItemRecord> {
        self.group
            .read_items()?
            .by_server(self.server_handle)
            .cloned()
            .ok_or_else(|| OpcError::NotFound(format!("item {}", self.server_handle)))
    }

    pub fn item_id(&self) -> OpcResult<String> {
        Ok(self.record()?.item_id)
    }

    pub fn client_handle(&self) -> OpcResult<ItemHandle> {
        Ok(self.record()?.client_handle)
    }

    pub fn is_active(&self) -> OpcResult<bool> {
        Ok(self.record()?.active)
    }

    pub fn requested_type(&self) -> OpcResult<VarType> {
        Ok(self.record()?.requested_type)
    }

    pub fn canonical_type(&self) -> OpcResult<VarType> {
        Ok(self.record()?.canonical_type)
    }

    pub fn access_rights(&self) -> OpcResult<AccessRights> {
        Ok(self.record()?.access_rights)
    }

    /// Reads the item and refreshes its cached value.
    pub fn read(&self, source: DataSource) -> OpcResult<ItemValue> {
        single(self.group().sync_read(source, &[self.server_handle])?)
    }

    pub fn write(&self, value: Value) -> OpcResult<()> {
        single(self.group().sync_write(&[self.server_handle], &[value])?)
    }

    pub fn set_active(&self, active: bool) -> OpcResult<()> {
        single(self.items().set_active(&[self.server_handle], active)?)
    }

    /// Gives the item a new client handle, unique within the group.
    pub fn set_client_handle(&self, client_handle: ItemHandle) -> OpcResult<()> {
        single(
            self.items()
                .set_client_handles(&[self.server_handle], &[client_handle])?,
        )
    }

    pub fn set_requested_type(&self, requested_type: VarType) -> OpcResult<()> {
        single(
            self.items()
                .set_datatypes(&[self.server_handle], &[requested_type])?,
        )
    }

    /// Kind of engineering units, read from the server's item properties.
    pub fn eu_type(&self) -> OpcResult<EuType> {
        let item_id = self.item_id()?;
        let value = single(self.group.item_properties(&item_id, &[PROPERTY_EU_TYPE])?)?;
        eu_type_of(&value)
    }

    /// Engineering units, read from the server's item properties.
    ///
    /// # Errors
    /// `Conversion` when the details do not match the reported kind.
    pub fn eu_info(&self) -> OpcResult<EuInfo> {
        let item_id = self.item_id()?;
        let mut values = self
            .group
            .item_properties(&item_id, &[PROPERTY_EU_TYPE, PROPERTY_EU_INFO])?
            .into_iter();
        let eu_type = single(values.next().into_iter().collect())?;
        let info = single(values.next().into_iter().collect())?;
        eu_info_of(eu_type_of(&eu_type)?, info)
    }

    fn group(&self) -> OpcGroup {
        OpcGroup::from_inner(Arc::clone(&self.group))
    }

    fn items(&self) -> OpcItems {
        OpcItems::new(Arc::clone(&self.group))
    }
}

fn single<T>(results: Vec<Result<T, ItemError>>) -> OpcResult<T> {
    results
        .into_iter()
        .next()
        .ok_or_else(|| OpcError::Internal("bulk call returned no result".into()))?
        .map_err(OpcError::from)
}

fn eu_type_of(value: &Value) -> OpcResult<EuType> {
    let raw = match value {
        Value::I16(v) => i32::from(*v),
        Value::U16(v) => i32::from(*v),
        Value::I32(v) => *v,
        Value::U32(v) => i32::try_from(*v)?,
        other => {
            return Err(OpcError::Conversion(format!(
                "EU type must be an integer, got {}",
                other.var_type()
            )));
        }
    };
    Ok(EuType::from(raw))
}

fn eu_info_of(eu_type: EuType, info: Value) -> OpcResult<EuInfo> {
    match (eu_type, info) {
        (EuType::NoUnits, _) => Ok(EuInfo::NoUnits),
        (EuType::Analog, Value::Array(ArrayValue::F64(range))) if range.len() == 2 => {
            Ok(EuInfo::Analog {
                low: range[0],
                high: range[1],
            })
        }
        (EuType::Analog, Value::Array(ArrayValue::F32(range))) if range.len() == 2 => {
            Ok(EuInfo::Analog {
                low: f64::from(range[0]),
                high: f64::from(range[1]),
            })
        }
        (EuType::Enumerated, Value::Array(ArrayValue::String(names))) => {
            Ok(EuInfo::Enumerated(names))
        }
        (EuType::Other(eu_type), info) => Ok(EuInfo::Other { eu_type, info }),
        (eu_type, info) => Err(OpcError::Conversion(format!(
            "EU info of type {} does not fit {eu_type:?} units",
            info.var_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eu_type_from_property_values() {
        assert_eq!(eu_type_of(&Value::I32(1)).unwrap(), EuType::Analog);
        assert_eq!(eu_type_of(&Value::I16(2)).unwrap(), EuType::Enumerated);
        assert_eq!(eu_type_of(&Value::U32(0)).unwrap(), EuType::NoUnits);
        assert_eq!(eu_type_of(&Value::I32(7)).unwrap(), EuType::Other(7));
        assert!(eu_type_of(&Value::String("1".into())).is_err());
    }

    #[test]
    fn test_eu_info_shapes() {
        let analog = Value::Array(ArrayValue::F32(vec![-1.0, 1.0]));
        assert_eq!(
            eu_info_of(EuType::Analog, analog).unwrap(),
            EuInfo::Analog {
                low: -1.0,
                high: 1.0
            }
        );
        assert_eq!(
            eu_info_of(EuType::NoUnits, Value::Empty).unwrap(),
            EuInfo::NoUnits
        );
        let names = Value::Array(ArrayValue::String(vec!["Off".into(), "On".into()]));
        assert_eq!(
            eu_info_of(EuType::Enumerated, names).unwrap(),
            EuInfo::Enumerated(vec!["Off".into(), "On".into()])
        );
        let short = Value::Array(ArrayValue::F64(vec![0.0]));
        assert!(matches!(
            eu_info_of(EuType::Analog, short),
            Err(OpcError::Conversion(_))
        ));
    }
}
