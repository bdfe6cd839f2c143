use std::ffi::c_void;

use super::{CancelEnvelope, DataEnvelope, Intake, RawItem, WriteEnvelope, borrowed, guarded};
use crate::com::object::{ComBox, ComObject, unknown_vtbl};
use crate::com::vtables::{IOPCDataCallback, IOPCDataCallbackVtbl};
use crate::com::{Handle, StatusCode};
use crate::variant::{FileTime, Variant, decode};

/// Sink for `IOPCDataCallback`, advised on a group's connection point.
///
/// Every method copies its arguments into an envelope, offers it to the
/// intake queues and returns `S_OK`, even when the envelope is dropped.
pub struct DataCallback {
    intake: Intake,
}

impl DataCallback {
    /// Builds the sink object with one reference held by the returned handle.
    pub fn create(intake: Intake) -> Handle<IOPCDataCallback> {
        ComBox::create(Self { intake })
    }

    pub fn intake(&self) -> &Intake {
        &self.intake
    }
}

static VTABLE: IOPCDataCallbackVtbl = IOPCDataCallbackVtbl {
    base: unknown_vtbl::<DataCallback>(),
    on_data_change,
    on_read_complete,
    on_write_complete,
    on_cancel_complete,
};

// SAFETY: every slot of `VTABLE` treats `this` as `ComBox<DataCallback>`.
unsafe impl ComObject for DataCallback {
    type Interface = IOPCDataCallback;

    fn vtable() -> &'static IOPCDataCallbackVtbl {
        &VTABLE
    }
}

/// # Safety
/// `this` must be a live sink; non-null arrays must hold `count` elements.
unsafe fn sink<'a>(this: *mut c_void) -> &'a DataCallback {
    // SAFETY: forwarded contract.
    unsafe { ComBox::<DataCallback>::from_this(this) }.inner()
}

/// Copies the parallel arrays of a data callback. Missing entries (null
/// arrays) fall back to empty values, bad quality and `E_FAIL`.
///
/// # Safety
/// Non-null arrays must hold `count` initialized elements.
#[allow(clippy::too_many_arguments)]
unsafe fn copy_data(
    transaction_id: u32,
    group: u32,
    master_quality: StatusCode,
    master_error: StatusCode,
    count: u32,
    client_items: *const u32,
    values: *const Variant,
    qualities: *const u16,
    timestamps: *const FileTime,
    errors: *const StatusCode,
) -> DataEnvelope {
    // SAFETY: forwarded contract; the arrays are only read.
    let (client_items, values, qualities, timestamps, errors) = unsafe {
        (
            borrowed(client_items, count),
            borrowed(values, count),
            borrowed(qualities, count),
            borrowed(timestamps, count),
            borrowed(errors, count),
        )
    };
    let items = client_items
        .iter()
        .enumerate()
        .map(|(i, &client_handle)| RawItem {
            client_handle,
            value: values
                .get(i)
                .map_or(Ok(crate::variant::Value::Empty), decode),
            quality: qualities.get(i).copied().unwrap_or(0),
            timestamp: timestamps.get(i).copied().unwrap_or_default(),
            error: errors.get(i).copied().unwrap_or(StatusCode::E_FAIL),
        })
        .collect();
    DataEnvelope {
        transaction_id,
        group,
        master_quality,
        master_error,
        items,
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn on_data_change(
    this: *mut c_void,
    transaction_id: u32,
    group: u32,
    master_quality: StatusCode,
    master_error: StatusCode,
    count: u32,
    client_items: *const u32,
    values: *const Variant,
    qualities: *const u16,
    timestamps: *const FileTime,
    errors: *const StatusCode,
) -> StatusCode {
    guarded(|| {
        // SAFETY: the server calls through our table with valid arrays.
        let (sink, envelope) = unsafe {
            (
                sink(this),
                copy_data(
                    transaction_id,
                    group,
                    master_quality,
                    master_error,
                    count,
                    client_items,
                    values,
                    qualities,
                    timestamps,
                    errors,
                ),
            )
        };
        tracing::trace!(group, transaction_id, count, "OnDataChange");
        sink.intake.offer_data_change(envelope);
    })
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn on_read_complete(
    this: *mut c_void,
    transaction_id: u32,
    group: u32,
    master_quality: StatusCode,
    master_error: StatusCode,
    count: u32,
    client_items: *const u32,
    values: *const Variant,
    qualities: *const u16,
    timestamps: *const FileTime,
    errors: *const StatusCode,
) -> StatusCode {
    guarded(|| {
        // SAFETY: as in `on_data_change`.
        let (sink, envelope) = unsafe {
            (
                sink(this),
                copy_data(
                    transaction_id,
                    group,
                    master_quality,
                    master_error,
                    count,
                    client_items,
                    values,
                    qualities,
                    timestamps,
                    errors,
                ),
            )
        };
        tracing::trace!(group, transaction_id, count, "OnReadComplete");
        sink.intake.offer_read_complete(envelope);
    })
}

unsafe extern "system" fn on_write_complete(
    this: *mut c_void,
    transaction_id: u32,
    group: u32,
    master_error: StatusCode,
    count: u32,
    client_items: *const u32,
    errors: *const StatusCode,
) -> StatusCode {
    guarded(|| {
        // SAFETY: the server calls through our table with valid arrays.
        let (sink, client_items, errors) = unsafe {
            (
                sink(this),
                borrowed(client_items, count),
                borrowed(errors, count),
            )
        };
        let items = client_items
            .iter()
            .enumerate()
            .map(|(i, &handle)| (handle, errors.get(i).copied().unwrap_or(StatusCode::E_FAIL)))
            .collect();
        tracing::trace!(group, transaction_id, count, "OnWriteComplete");
        sink.intake.offer_write_complete(WriteEnvelope {
            transaction_id,
            group,
            master_error,
            items,
        });
    })
}

unsafe extern "system" fn on_cancel_complete(
    this: *mut c_void,
    transaction_id: u32,
    group: u32,
) -> StatusCode {
    guarded(|| {
        // SAFETY: the server calls through our table.
        let sink = unsafe { sink(this) };
        tracing::trace!(group, transaction_id, "OnCancelComplete");
        sink.intake.offer_cancel_complete(CancelEnvelope {
            transaction_id,
            group,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::intake;
    use crate::com::Interface;
    use crate::com::vtables::IOPCServer;
    use crate::variant::{Value, encode};
    use std::time::{Duration, Instant};

    fn call_data_change(handle: &Handle<IOPCDataCallback>, tid: u32, value: i32) -> StatusCode {
        let encoded = encode(&Value::I32(value)).unwrap();
        let clients = [7u32];
        let qualities = [0xC0u16];
        let stamps = [FileTime::from_u64(133_000_000_000_000_000)];
        let errors = [StatusCode::S_OK];
        // SAFETY: single-element arrays matching `count`.
        unsafe {
            (handle.vtable().on_data_change)(
                handle.as_raw(),
                tid,
                1,
                StatusCode::S_OK,
                StatusCode::S_OK,
                1,
                clients.as_ptr(),
                encoded.as_variant(),
                qualities.as_ptr(),
                stamps.as_ptr(),
                errors.as_ptr(),
            )
        }
    }

    #[test]
    fn test_data_change_is_copied_into_envelope() {
        let (intake, mut receivers) = intake(4);
        let handle = DataCallback::create(intake);
        assert_eq!(call_data_change(&handle, 5, 42), StatusCode::S_OK);

        let envelope = receivers.data_change.try_recv().unwrap();
        assert_eq!(envelope.transaction_id, 5);
        assert_eq!(envelope.items.len(), 1);
        assert_eq!(envelope.items[0].client_handle, 7);
        assert_eq!(envelope.items[0].value, Ok(Value::I32(42)));
        assert_eq!(envelope.items[0].quality, 0xC0);
    }

    #[test]
    fn test_full_intake_returns_promptly() {
        let (intake, mut receivers) = intake(1);
        let handle = DataCallback::create(intake);
        assert_eq!(call_data_change(&handle, 1, 1), StatusCode::S_OK);

        let started = Instant::now();
        for tid in 2..50 {
            assert_eq!(call_data_change(&handle, tid, 1), StatusCode::S_OK);
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        // SAFETY: the handle refers to a `ComBox<DataCallback>`.
        let sink = unsafe { crate::com::object::inner_of::<DataCallback>(&handle) };
        assert_eq!(sink.intake().dropped(), 48);
        assert_eq!(receivers.data_change.try_recv().unwrap().transaction_id, 1);
    }

    #[test]
    fn test_write_complete_with_null_errors_marks_failure() {
        let (intake, mut receivers) = intake(4);
        let handle = DataCallback::create(intake);
        let clients = [1u32, 2];
        // SAFETY: `clients` holds two elements; a null error array is tolerated.
        let status = unsafe {
            (handle.vtable().on_write_complete)(
                handle.as_raw(),
                9,
                3,
                StatusCode::S_FALSE,
                2,
                clients.as_ptr(),
                std::ptr::null(),
            )
        };
        assert_eq!(status, StatusCode::S_OK);
        let envelope = receivers.write_complete.try_recv().unwrap();
        assert_eq!(
            envelope.items,
            vec![(1, StatusCode::E_FAIL), (2, StatusCode::E_FAIL)]
        );
    }

    #[test]
    fn test_sink_refuses_foreign_interfaces() {
        let (intake, _receivers) = intake(1);
        let handle = DataCallback::create(intake);
        assert_eq!(
            handle.query::<IOPCServer>().err(),
            Some(StatusCode::E_NOINTERFACE)
        );
        assert!(handle.query_iid(&IOPCDataCallback::IID).is_ok());
    }
}
