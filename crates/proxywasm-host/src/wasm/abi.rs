//! Host side of the proxy-wasm ABI (v0.2.1 subset).
//!
//! Every import is a thin shim: decode arguments from guest memory, perform
//! the operation against the [`HostState`] (which routes capabilities
//! through the instance's [`CapabilityBridge`](crate::bridge::CapabilityBridge)),
//! and encode the result back.  Guest mistakes are reported as ABI status
//! codes; only failures of the guest's own allocator trap.

use std::time::{SystemTime, UNIX_EPOCH};

use wasmtime::{Caller, Extern, Linker, Memory};

use super::{HostState, MetricSlot, ROOT_CONTEXT_ID};
use crate::error::HostError;
use crate::logging::LogLevel;
use crate::machine::LocalResponse;
use crate::metrics::MetricKind;
use crate::transport::{HeaderList, HttpCallRequest};

/// Proxy-wasm status codes returned by host imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub(crate) enum Status {
    Ok = 0,
    NotFound = 1,
    BadArgument = 2,
    InvalidMemoryAccess = 6,
    Empty = 7,
    InternalFailure = 10,
    Unimplemented = 12,
}

/// Why an import did not complete normally.
enum AbiError {
    /// Reported to the guest as a status code.
    Status(Status),
    /// Aborts the current callback.
    Trap(wasmtime::Error),
}

impl From<Status> for AbiError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl From<wasmtime::Error> for AbiError {
    fn from(err: wasmtime::Error) -> Self {
        Self::Trap(err)
    }
}

type AbiResult = std::result::Result<(), AbiError>;

fn finish(result: AbiResult) -> wasmtime::Result<i32> {
    match result {
        Ok(()) => Ok(Status::Ok as i32),
        Err(AbiError::Status(status)) => Ok(status as i32),
        Err(AbiError::Trap(err)) => Err(err),
    }
}

// Map and buffer selectors.
const MAP_REQUEST_HEADERS: i32 = 0;
const MAP_CALL_RESPONSE_HEADERS: i32 = 6;
const MAP_MAX: i32 = 7;

const BUFFER_REQUEST_BODY: i32 = 0;
const BUFFER_CALL_RESPONSE_BODY: i32 = 4;
const BUFFER_VM_CONFIGURATION: i32 = 6;
const BUFFER_PLUGIN_CONFIGURATION: i32 = 7;

const STREAM_REQUEST: i32 = 0;

/// Register every supported import under module `env`.
pub(crate) fn define(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
            finish(log(&mut caller, level, ptr, len))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_log_level",
        |mut caller: Caller<'_, HostState>, return_level: i32| {
            let level = caller
                .data()
                .bridge
                .as_ref()
                .map_or(LogLevel::Trace, |b| b.log_level());
            finish(write_u32(&mut caller, return_level, level.as_abi() as u32))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_current_time_nanoseconds",
        |mut caller: Caller<'_, HostState>, return_time: i32| {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64);
            finish(write(&mut caller, return_time, &nanos.to_le_bytes()))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_set_tick_period_milliseconds",
        |mut caller: Caller<'_, HostState>, period: i32| {
            // Zero disables the timer; negative periods are rejected.
            match u32::try_from(period) {
                Ok(period) => {
                    caller.data_mut().tick_period_ms = period;
                    finish(Ok(()))
                }
                Err(_) => finish(Err(Status::BadArgument.into())),
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_set_effective_context",
        |mut caller: Caller<'_, HostState>, context_id: i32| {
            let state = caller.data_mut();
            let context_id = context_id as u32;
            let known = context_id == ROOT_CONTEXT_ID
                || state
                    .exchange
                    .as_ref()
                    .is_some_and(|ex| ex.context_id == context_id);
            if known {
                state.effective_context = context_id;
                finish(Ok(()))
            } else {
                finish(Err(Status::BadArgument.into()))
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_buffer_bytes",
        |mut caller: Caller<'_, HostState>,
         buffer_type: i32,
         start: i32,
         max_size: i32,
         return_ptr: i32,
         return_size: i32| {
            finish(get_buffer_bytes(
                &mut caller,
                buffer_type,
                start,
                max_size,
                return_ptr,
                return_size,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_buffer_status",
        |mut caller: Caller<'_, HostState>, buffer_type: i32, return_len: i32, return_flags: i32| {
            let result = buffer(caller.data(), buffer_type).and_then(|buf| {
                let len = buf.ok_or(Status::NotFound)?.len() as u32;
                write_u32(&mut caller, return_len, len)?;
                write_u32(&mut caller, return_flags, 0)
            });
            finish(result)
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_header_map_value",
        |mut caller: Caller<'_, HostState>,
         map_type: i32,
         key_ptr: i32,
         key_len: i32,
         return_ptr: i32,
         return_size: i32| {
            finish(get_header_value(
                &mut caller,
                map_type,
                key_ptr,
                key_len,
                return_ptr,
                return_size,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_header_map_pairs",
        |mut caller: Caller<'_, HostState>, map_type: i32, return_ptr: i32, return_size: i32| {
            let result = header_map(caller.data(), map_type).and_then(|headers| {
                let encoded = encode_pairs(&headers.unwrap_or_default());
                copy_out(&mut caller, &encoded, return_ptr, return_size)
            });
            finish(result)
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_add_header_map_value",
        |mut caller: Caller<'_, HostState>,
         map_type: i32,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32| {
            finish(mutate_header(
                &mut caller,
                map_type,
                key_ptr,
                key_len,
                Some((value_ptr, value_len)),
                HeaderOp::Add,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_replace_header_map_value",
        |mut caller: Caller<'_, HostState>,
         map_type: i32,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32| {
            finish(mutate_header(
                &mut caller,
                map_type,
                key_ptr,
                key_len,
                Some((value_ptr, value_len)),
                HeaderOp::Replace,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_remove_header_map_value",
        |mut caller: Caller<'_, HostState>, map_type: i32, key_ptr: i32, key_len: i32| {
            finish(mutate_header(
                &mut caller,
                map_type,
                key_ptr,
                key_len,
                None,
                HeaderOp::Remove,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_send_local_response",
        |mut caller: Caller<'_, HostState>,
         status: i32,
         details_ptr: i32,
         details_len: i32,
         body_ptr: i32,
         body_len: i32,
         headers_ptr: i32,
         headers_len: i32,
         _grpc_status: i32| {
            finish(send_local_response(
                &mut caller,
                status,
                (details_ptr, details_len),
                (body_ptr, body_len),
                (headers_ptr, headers_len),
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_continue_stream",
        |mut caller: Caller<'_, HostState>, stream_type: i32| {
            if stream_type != STREAM_REQUEST {
                return finish(Err(Status::Unimplemented.into()));
            }
            finish(resume(&mut caller))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_continue_request",
        |mut caller: Caller<'_, HostState>| finish(resume(&mut caller)),
    )?;

    linker.func_wrap(
        "env",
        "proxy_http_call",
        |mut caller: Caller<'_, HostState>,
         upstream_ptr: i32,
         upstream_len: i32,
         headers_ptr: i32,
         headers_len: i32,
         body_ptr: i32,
         body_len: i32,
         _trailers_ptr: i32,
         _trailers_len: i32,
         timeout_ms: i32,
         return_token: i32| {
            finish(http_call(
                &mut caller,
                (upstream_ptr, upstream_len),
                (headers_ptr, headers_len),
                (body_ptr, body_len),
                timeout_ms,
                return_token,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_define_metric",
        |mut caller: Caller<'_, HostState>,
         metric_type: i32,
         name_ptr: i32,
         name_len: i32,
         return_id: i32| {
            finish(define_metric(
                &mut caller,
                metric_type,
                name_ptr,
                name_len,
                return_id,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_increment_metric",
        |mut caller: Caller<'_, HostState>, metric_id: i32, offset: i64| {
            finish(update_metric(caller.data_mut(), metric_id, offset, MetricOp::Increment))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_record_metric",
        |mut caller: Caller<'_, HostState>, metric_id: i32, value: i64| {
            finish(update_metric(caller.data_mut(), metric_id, value, MetricOp::Record))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_metric",
        |mut caller: Caller<'_, HostState>, metric_id: i32, return_value: i32| {
            let value = metric_slot(caller.data(), metric_id).map(|slot| slot.value);
            let result = value
                .map_err(AbiError::from)
                .and_then(|v| write(&mut caller, return_value, &(v as u64).to_le_bytes()));
            finish(result)
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_call_foreign_function",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         args_ptr: i32,
         args_len: i32,
         return_ptr: i32,
         return_size: i32| {
            finish(call_foreign_function(
                &mut caller,
                (name_ptr, name_len),
                (args_ptr, args_len),
                return_ptr,
                return_size,
            ))
        },
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Guest memory
// ---------------------------------------------------------------------------

fn memory(caller: &mut Caller<'_, HostState>) -> std::result::Result<Memory, AbiError> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(Status::InternalFailure.into()),
    }
}

fn read(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> std::result::Result<Vec<u8>, AbiError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let memory = memory(caller)?;
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .ok_or(Status::InvalidMemoryAccess)?;
    // Bounds are checked against guest memory before anything is copied.
    let bytes = memory
        .data(&*caller)
        .get(start..end)
        .ok_or(Status::InvalidMemoryAccess)?;
    Ok(bytes.to_vec())
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> std::result::Result<String, AbiError> {
    let bytes = read(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write(caller: &mut Caller<'_, HostState>, ptr: i32, bytes: &[u8]) -> AbiResult {
    let memory = memory(caller)?;
    memory
        .write(&mut *caller, ptr as u32 as usize, bytes)
        .map_err(|_| Status::InvalidMemoryAccess)?;
    Ok(())
}

fn write_u32(caller: &mut Caller<'_, HostState>, ptr: i32, value: u32) -> AbiResult {
    write(caller, ptr, &value.to_le_bytes())
}

/// Allocate guest memory through the module's exported allocator.
fn allocate(caller: &mut Caller<'_, HostState>, len: usize) -> std::result::Result<i32, AbiError> {
    let Some(func) = caller
        .get_export("proxy_on_memory_allocate")
        .or_else(|| caller.get_export("malloc"))
        .and_then(Extern::into_func)
    else {
        tracing::warn!("module exports no allocator, cannot return data");
        return Err(Status::InternalFailure.into());
    };
    let alloc = func.typed::<i32, i32>(&*caller)?;
    let ptr = alloc.call(&mut *caller, len as i32)?;
    if ptr == 0 {
        return Err(Status::InternalFailure.into());
    }
    Ok(ptr)
}

/// Copy `bytes` into freshly allocated guest memory and report its address
/// and length through the two return pointers.
fn copy_out(caller: &mut Caller<'_, HostState>, bytes: &[u8], return_ptr: i32, return_size: i32) -> AbiResult {
    let addr = if bytes.is_empty() {
        0
    } else {
        let addr = allocate(caller, bytes.len())?;
        write(caller, addr, bytes)?;
        addr
    };
    write_u32(caller, return_ptr, addr as u32)?;
    write_u32(caller, return_size, bytes.len() as u32)
}

// ---------------------------------------------------------------------------
// Header pair encoding
// ---------------------------------------------------------------------------

/// Serialize headers: u32 count, a (key_len, value_len) pair per entry, then
/// every key and value followed by a NUL byte.  All integers little-endian.
pub(crate) fn encode_pairs(headers: &[(String, String)]) -> Vec<u8> {
    let data_len: usize = headers.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    let mut out = Vec::with_capacity(4 + headers.len() * 8 + data_len);
    out.extend_from_slice(&(headers.len() as u32).to_le_bytes());
    for (k, v) in headers {
        out.extend_from_slice(&(k.len() as u32).to_le_bytes());
        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
    }
    for (k, v) in headers {
        out.extend_from_slice(k.as_bytes());
        out.push(0);
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

/// Inverse of [`encode_pairs`].  `None` on malformed input.
pub(crate) fn decode_pairs(bytes: &[u8]) -> Option<HeaderList> {
    if bytes.is_empty() {
        return Some(Vec::new());
    }
    let u32_at = |at: usize| -> Option<usize> {
        let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw) as usize)
    };

    let count = u32_at(0)?;
    let mut sizes = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        let at = 4 + i * 8;
        sizes.push((u32_at(at)?, u32_at(at + 4)?));
    }

    let mut cursor = 4usize.checked_add(count.checked_mul(8)?)?;
    let mut take = |len: usize| -> Option<String> {
        let end = cursor.checked_add(len)?;
        let s = String::from_utf8_lossy(bytes.get(cursor..end)?).into_owned();
        if bytes.get(end) != Some(&0) {
            return None;
        }
        cursor = end + 1;
        Some(s)
    };

    let mut headers = Vec::with_capacity(sizes.len());
    for (key_len, value_len) in sizes {
        let key = take(key_len)?;
        let value = take(value_len)?;
        headers.push((key, value));
    }
    Some(headers)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

fn log(caller: &mut Caller<'_, HostState>, level: i32, ptr: i32, len: i32) -> AbiResult {
    let message = read_string(caller, ptr, len)?;
    let level = LogLevel::from_abi(level);
    match caller.data().bridge.as_ref() {
        Some(bridge) => bridge.log(level, &message),
        None => tracing::debug!(%level, plugin_msg = %message, "log before start"),
    }
    Ok(())
}

/// Snapshot of a buffer.  `Ok(None)` when the buffer type is valid but
/// nothing is available in the current callback.
fn buffer(state: &HostState, buffer_type: i32) -> std::result::Result<Option<Vec<u8>>, AbiError> {
    let buf = match buffer_type {
        BUFFER_REQUEST_BODY => state.exchange.as_ref().map(|ex| ex.body.clone()),
        BUFFER_CALL_RESPONSE_BODY => match &state.call_response {
            Some(Ok(response)) => Some(response.body.clone()),
            _ => None,
        },
        BUFFER_VM_CONFIGURATION => Some(Vec::new()),
        BUFFER_PLUGIN_CONFIGURATION => state.bridge.as_ref().map(|b| b.configuration().to_vec()),
        1..=5 => None,
        _ => return Err(Status::BadArgument.into()),
    };
    Ok(buf)
}

fn get_buffer_bytes(
    caller: &mut Caller<'_, HostState>,
    buffer_type: i32,
    start: i32,
    max_size: i32,
    return_ptr: i32,
    return_size: i32,
) -> AbiResult {
    let buf = buffer(caller.data(), buffer_type)?.ok_or(Status::NotFound)?;
    if buf.is_empty() {
        return Err(Status::Empty.into());
    }
    let start = start as u32 as usize;
    if start > buf.len() {
        return Err(Status::BadArgument.into());
    }
    let end = start.saturating_add(max_size as u32 as usize).min(buf.len());
    copy_out(caller, &buf[start..end], return_ptr, return_size)
}

/// Snapshot of a header map.  `Ok(None)` when the map type is valid but not
/// available in the current callback.
fn header_map(state: &HostState, map_type: i32) -> std::result::Result<Option<HeaderList>, AbiError> {
    let headers = match map_type {
        MAP_REQUEST_HEADERS => state.exchange.as_ref().map(|ex| ex.request.abi_headers()),
        MAP_CALL_RESPONSE_HEADERS => match &state.call_response {
            Some(Ok(response)) => {
                let mut all = Vec::with_capacity(response.headers.len() + 1);
                all.push((":status".to_string(), response.status.to_string()));
                all.extend(response.headers.iter().cloned());
                Some(all)
            }
            _ => None,
        },
        1..=MAP_MAX => None,
        _ => return Err(Status::BadArgument.into()),
    };
    Ok(headers)
}

fn get_header_value(
    caller: &mut Caller<'_, HostState>,
    map_type: i32,
    key_ptr: i32,
    key_len: i32,
    return_ptr: i32,
    return_size: i32,
) -> AbiResult {
    let key = read_string(caller, key_ptr, key_len)?;
    let headers = header_map(caller.data(), map_type)?.ok_or(Status::NotFound)?;
    let value = headers
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        .map(|(_, v)| v)
        .ok_or(Status::NotFound)?;
    copy_out(caller, value.as_bytes(), return_ptr, return_size)
}

#[derive(Clone, Copy)]
enum HeaderOp {
    Add,
    Replace,
    Remove,
}

fn mutate_header(
    caller: &mut Caller<'_, HostState>,
    map_type: i32,
    key_ptr: i32,
    key_len: i32,
    value: Option<(i32, i32)>,
    op: HeaderOp,
) -> AbiResult {
    if map_type != MAP_REQUEST_HEADERS {
        return Err(if (0..=MAP_MAX).contains(&map_type) {
            Status::Unimplemented
        } else {
            Status::BadArgument
        }
        .into());
    }
    let key = read_string(caller, key_ptr, key_len)?;
    let value = match value {
        Some((ptr, len)) => read_string(caller, ptr, len)?,
        None => String::new(),
    };
    let exchange = caller
        .data_mut()
        .exchange
        .as_mut()
        .ok_or(Status::NotFound)?;
    let head = &mut exchange.request;
    match op {
        HeaderOp::Add => head.add_header(&key, &value),
        HeaderOp::Replace => head.set_header(&key, &value),
        HeaderOp::Remove => head.remove_header(&key),
    }
    Ok(())
}

fn send_local_response(
    caller: &mut Caller<'_, HostState>,
    status: i32,
    details: (i32, i32),
    body: (i32, i32),
    headers: (i32, i32),
) -> AbiResult {
    let status = u16::try_from(status)
        .ok()
        .filter(|s| (100..=599).contains(s))
        .ok_or(Status::BadArgument)?;
    let details = read_string(caller, details.0, details.1)?;
    let body = read(caller, body.0, body.1)?;
    let raw_headers = read(caller, headers.0, headers.1)?;
    let headers = decode_pairs(&raw_headers).ok_or(Status::BadArgument)?;

    let state = caller.data_mut();
    let bridge = state.bridge.clone().ok_or(Status::InternalFailure)?;
    let exchange = state.exchange.as_mut().ok_or(Status::BadArgument)?;
    bridge.send_local_response(
        exchange,
        LocalResponse {
            status,
            headers,
            body,
            details,
        },
    );
    Ok(())
}

fn resume(caller: &mut Caller<'_, HostState>) -> AbiResult {
    let state = caller.data_mut();
    let bridge = state.bridge.clone().ok_or(Status::InternalFailure)?;
    let exchange = state.exchange.as_mut().ok_or(Status::BadArgument)?;
    bridge.resume(exchange);
    Ok(())
}

fn http_call(
    caller: &mut Caller<'_, HostState>,
    upstream: (i32, i32),
    headers: (i32, i32),
    body: (i32, i32),
    timeout_ms: i32,
    return_token: i32,
) -> AbiResult {
    let upstream = read_string(caller, upstream.0, upstream.1)?;
    let raw_headers = read(caller, headers.0, headers.1)?;
    let headers = decode_pairs(&raw_headers).ok_or(Status::BadArgument)?;
    let body = read(caller, body.0, body.1)?;

    let mut request = HttpCallRequest::from_pseudo_headers(headers, body);
    if timeout_ms > 0 {
        request = request.with_timeout(std::time::Duration::from_millis(timeout_ms as u64));
    }

    let state = caller.data_mut();
    let bridge = state.bridge.clone().ok_or(Status::InternalFailure)?;
    let Some(exchange) = state.exchange.as_mut() else {
        return Err(Status::Unimplemented.into());
    };
    let token = match bridge.issue_http_call(exchange, &upstream, request) {
        Ok(token) => token,
        Err(HostError::NotFound { .. }) => return Err(Status::NotFound.into()),
        Err(e) => {
            tracing::warn!(plugin = bridge.plugin_name(), error = %e, "http call rejected");
            return Err(Status::InternalFailure.into());
        }
    };
    write_u32(caller, return_token, token)
}

fn define_metric(
    caller: &mut Caller<'_, HostState>,
    metric_type: i32,
    name_ptr: i32,
    name_len: i32,
    return_id: i32,
) -> AbiResult {
    let kind = MetricKind::from_abi(metric_type).ok_or(Status::BadArgument)?;
    let name = read_string(caller, name_ptr, name_len)?;
    if name.is_empty() {
        return Err(Status::BadArgument.into());
    }

    let metrics = &mut caller.data_mut().metrics;
    let index = match metrics.iter().position(|m| m.name == name) {
        Some(index) if metrics[index].kind == kind => index,
        Some(_) => return Err(Status::BadArgument.into()),
        None => {
            metrics.push(MetricSlot {
                name,
                kind,
                value: 0,
            });
            metrics.len() - 1
        }
    };
    write_u32(caller, return_id, index as u32 + 1)
}

fn metric_slot(state: &HostState, metric_id: i32) -> std::result::Result<&MetricSlot, Status> {
    let index = (metric_id as u32 as usize).checked_sub(1).ok_or(Status::NotFound)?;
    state.metrics.get(index).ok_or(Status::NotFound)
}

#[derive(Clone, Copy)]
enum MetricOp {
    Increment,
    Record,
}

fn update_metric(state: &mut HostState, metric_id: i32, value: i64, op: MetricOp) -> AbiResult {
    let index = (metric_id as u32 as usize)
        .checked_sub(1)
        .filter(|i| *i < state.metrics.len())
        .ok_or(Status::NotFound)?;
    let slot = &mut state.metrics[index];

    // What is forwarded to the sink: counters take deltas, gauges the new
    // absolute value, histograms the observation.
    let forwarded = match (slot.kind, op) {
        (MetricKind::Counter, MetricOp::Increment) => {
            slot.value = slot.value.saturating_add(value);
            value
        }
        (MetricKind::Gauge, MetricOp::Increment) => {
            slot.value = slot.value.saturating_add(value);
            slot.value
        }
        (MetricKind::Gauge, MetricOp::Record) | (MetricKind::Histogram, MetricOp::Record) => {
            slot.value = value;
            value
        }
        (MetricKind::Counter, MetricOp::Record) | (MetricKind::Histogram, MetricOp::Increment) => {
            return Err(Status::BadArgument.into());
        }
    };

    if let Some(bridge) = &state.bridge {
        bridge.record_metric(&slot.name, slot.kind, forwarded);
    }
    Ok(())
}

fn call_foreign_function(
    caller: &mut Caller<'_, HostState>,
    name: (i32, i32),
    args: (i32, i32),
    return_ptr: i32,
    return_size: i32,
) -> AbiResult {
    let name = read_string(caller, name.0, name.1)?;
    let args = read(caller, args.0, args.1)?;
    let bridge = caller.data().bridge.clone().ok_or(Status::InternalFailure)?;
    let output = match bridge.call_foreign_function(&name, &args) {
        Ok(output) => output,
        Err(HostError::NotFound { .. }) => return Err(Status::NotFound.into()),
        Err(e) => {
            tracing::warn!(plugin = bridge.plugin_name(), function = %name, error = %e, "foreign function failed");
            return Err(Status::InternalFailure.into());
        }
    };
    copy_out(caller, &output, return_ptr, return_size)
}
