//! Cross-runtime array interchange over the Arrow C data interface.
//!
//! The descriptors themselves ([`FFI_ArrowArray`] and [`FFI_ArrowSchema`])
//! and their release callbacks come from `arrow::ffi`. Whoever holds a live
//! descriptor owns the memory behind it and must release it exactly once;
//! children and dictionary are released by their parent. This module adds an
//! owning guard for a descriptor pair, memory pool accounting that lasts
//! until the consumer releases what it imported, and the move operation
//! consumers use to take a descriptor out of foreign memory.
//!
//! ```
//! use arrow_array::{Array, Int32Array};
//! use quarry::ffi::{export_array, import_array};
//!
//! let exported = export_array(&Int32Array::from(vec![1, 2, 42])).unwrap();
//! let imported = import_array(exported).unwrap();
//! assert_eq!(imported.len(), 3);
//! ```

use std::{
    panic::AssertUnwindSafe,
    ptr::{self, NonNull},
    sync::Arc,
};

use arrow::ffi::{from_ffi, to_ffi};
use arrow_array::{Array, ArrayRef, make_array};
use arrow_buffer::{BooleanBuffer, Buffer, NullBuffer};
use arrow_data::ArrayData;

pub use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema};
pub use arrow_schema::ffi::Flags;

use crate::{
    QuarryError, Result,
    memory::{MemoryPool, MemoryReservation},
};

/// An exported array descriptor and the schema describing it, both heap
/// allocated so their addresses can be handed to foreign code.
///
/// Dropping the guard releases whatever it still owns. A descriptor moved
/// out with [`move_array`] reads as released and is skipped.
#[derive(Debug)]
pub struct ExportedArray {
    array: Box<FFI_ArrowArray>,
    schema: Box<FFI_ArrowSchema>,
}

impl ExportedArray {
    /// Take ownership of a descriptor pair, e.g. one moved out of foreign
    /// memory with [`move_array`].
    pub fn new(array: FFI_ArrowArray, schema: FFI_ArrowSchema) -> Self {
        Self {
            array: Box::new(array),
            schema: Box::new(schema),
        }
    }

    /// Take ownership of descriptors previously leaked with
    /// [`ExportedArray::into_raw`].
    ///
    /// # Safety
    ///
    /// Both pointers must come from `into_raw` and not be used afterwards.
    pub unsafe fn from_raw(array: *mut FFI_ArrowArray, schema: *mut FFI_ArrowSchema) -> Self {
        // SAFETY: upheld by the caller.
        unsafe {
            Self {
                array: Box::from_raw(array),
                schema: Box::from_raw(schema),
            }
        }
    }

    /// Leak both descriptors, handing responsibility for releasing them (and
    /// for freeing the allocations) to the caller.
    pub fn into_raw(self) -> (*mut FFI_ArrowArray, *mut FFI_ArrowSchema) {
        (Box::into_raw(self.array), Box::into_raw(self.schema))
    }

    pub fn into_parts(self) -> (FFI_ArrowArray, FFI_ArrowSchema) {
        (*self.array, *self.schema)
    }

    pub fn array(&self) -> &FFI_ArrowArray {
        &self.array
    }

    pub fn schema(&self) -> &FFI_ArrowSchema {
        &self.schema
    }

    pub fn as_mut_ptr(&mut self) -> *mut FFI_ArrowArray {
        &mut *self.array
    }

    pub fn schema_mut_ptr(&mut self) -> *mut FFI_ArrowSchema {
        &mut *self.schema
    }

    /// Whether the array descriptor was released or moved out.
    pub fn is_released(&self) -> bool {
        self.array.is_released()
    }

    /// Release both descriptors now.
    ///
    /// Releasing a descriptor twice means two owners believe they hold it,
    /// and the buffers it describes may already be reused. The process is
    /// aborted rather than continuing on memory nobody owns.
    pub fn release(&mut self) {
        if self.is_released() {
            log::error!("interchange descriptor released twice");
            std::process::abort();
        }
        // Dropping a live descriptor runs its release callback.
        *self.array = FFI_ArrowArray::empty();
        *self.schema = FFI_ArrowSchema::empty();
    }
}

/// Move `src` into `dst`, leaving `src` released. `dst` must not hold a live
/// descriptor, since it is overwritten without being released.
///
/// # Safety
///
/// Both pointers must be valid and properly aligned.
pub unsafe fn move_array(src: *mut FFI_ArrowArray, dst: *mut FFI_ArrowArray) {
    // SAFETY: upheld by the caller.
    unsafe { ptr::write(dst, FFI_ArrowArray::from_raw(src)) }
}

fn unsupported(data: &ArrayData, err: arrow_schema::ArrowError) -> QuarryError {
    log::debug!("cannot describe {} for interchange: {err}", data.data_type());
    QuarryError::UnsupportedInterchangeFormat {
        format: data.data_type().to_string(),
    }
}

fn export_data(data: &ArrayData) -> Result<ExportedArray> {
    let (array, schema) = to_ffi(data).map_err(|err| unsupported(data, err))?;
    Ok(ExportedArray::new(array, schema))
}

/// Export `array` without charging any memory pool.
pub fn export_array(array: &dyn Array) -> Result<ExportedArray> {
    export_data(&array.to_data())
}

/// Export `array`, charging its memory to `pool` until the descriptor and
/// every array imported from it are released.
pub fn export_array_with_pool(
    array: &dyn Array,
    pool: Arc<dyn MemoryPool>,
) -> Result<ExportedArray> {
    let data = array.to_data();
    let mut reservation = MemoryReservation::new(pool);
    reservation.try_grow(data.get_array_memory_size())?;
    let charge = Arc::new(reservation);
    export_data(&charge_buffers(&data, &charge)?)
}

/// Export `array` into caller-provided memory.
///
/// # Safety
///
/// Both pointers must be valid for writes and must not hold live
/// descriptors; they are overwritten without being released.
pub unsafe fn export_array_into(
    array: &dyn Array,
    out_array: *mut FFI_ArrowArray,
    out_schema: *mut FFI_ArrowSchema,
) -> Result<()> {
    if out_array.is_null() || out_schema.is_null() {
        return Err(QuarryError::malformed("null output descriptor"));
    }
    let (array, schema) = export_array(array)?.into_parts();
    // SAFETY: both targets are valid per the caller.
    unsafe {
        ptr::write(out_array, array);
        ptr::write(out_schema, schema);
    }
    Ok(())
}

/// The same array with every buffer holding a share of `charge`. The charge
/// goes back to its pool when the last of those buffers is dropped, which
/// for an exported array is when the consumer releases it.
fn charge_buffers(data: &ArrayData, charge: &Arc<MemoryReservation>) -> Result<ArrayData> {
    let buffers = data
        .buffers()
        .iter()
        .map(|buffer| charged(buffer, charge))
        .collect::<Result<Vec<_>>>()?;
    let children = data
        .child_data()
        .iter()
        .map(|child| charge_buffers(child, charge))
        .collect::<Result<Vec<_>>>()?;
    let nulls = match data.nulls() {
        Some(nulls) => {
            let bits = nulls.inner();
            let buffer = charged(bits.inner(), charge)?;
            Some(NullBuffer::new(BooleanBuffer::new(buffer, bits.offset(), bits.len())))
        }
        None => None,
    };
    Ok(data
        .clone()
        .into_builder()
        .buffers(buffers)
        .child_data(children)
        .nulls(nulls)
        .build()?)
}

fn charged(buffer: &Buffer, charge: &Arc<MemoryReservation>) -> Result<Buffer> {
    let ptr = NonNull::new(buffer.as_ptr().cast_mut())
        .ok_or_else(|| QuarryError::malformed("buffer without an address"))?;
    let owner = Arc::new(AssertUnwindSafe((buffer.clone(), Arc::clone(charge))));
    // SAFETY: `owner` keeps the original allocation alive for as long as the
    // returned buffer exists, and the range is the original buffer's.
    Ok(unsafe { Buffer::from_custom_allocation(ptr, buffer.len(), owner) })
}

fn release_violation(reason: &str) -> QuarryError {
    QuarryError::ReleaseViolation {
        reason: reason.to_string(),
    }
}

fn import_owned(array: FFI_ArrowArray, schema: &FFI_ArrowSchema) -> Result<ArrayRef> {
    // SAFETY: `array` is live and owned; `from_ffi` wraps its buffers so the
    // last one dropped releases it, or releases it on failure.
    let data = unsafe { from_ffi(array, schema) }
        .map_err(|err| QuarryError::malformed(err.to_string()))?;
    data.validate_full()
        .map_err(|err| QuarryError::malformed(err.to_string()))?;
    Ok(make_array(data))
}

/// Import a descriptor pair held by a guard, without copying its buffers.
pub fn import_array(exported: ExportedArray) -> Result<ArrayRef> {
    if exported.is_released() {
        return Err(release_violation("descriptor is already released"));
    }
    let (array, schema) = exported.into_parts();
    import_owned(array, &schema)
}

/// Take ownership of the array descriptor at `array` and build an array over
/// its buffers without copying. `schema` is only borrowed.
///
/// The descriptor is moved out and `array` is left released, whether or not
/// the import succeeds; on failure the moved descriptor is released before
/// returning.
///
/// # Safety
///
/// Non-null pointers must point to descriptors that are either released or
/// describe buffers valid for the lengths they declare until released.
pub unsafe fn import_array_raw(
    array: *mut FFI_ArrowArray,
    schema: *const FFI_ArrowSchema,
) -> Result<ArrayRef> {
    if array.is_null() || schema.is_null() {
        return Err(release_violation("null descriptor"));
    }
    // SAFETY: both pointers are valid per the caller.
    unsafe {
        if (*array).is_released() {
            return Err(release_violation("descriptor is already released"));
        }
        import_owned(FFI_ArrowArray::from_raw(array), &*schema)
    }
}
