// C ABI over the client. Handles are boxed Rust objects behind raw
// pointers; every function checks for null before touching them and reports
// through the status codes of `ErrorKind::code`: 0 on success, negative for
// local argument or lifecycle failures, positive for failures of the
// exchange itself. Mirrors include/dendrite.h.

#![allow(clippy::missing_safety_doc)]

use std::{
    ffi::{c_char, c_int, CStr, CString},
    ptr, slice,
};

use tracing::debug;

use crate::{
    client::{
        Client, CompletionSink, Delivery, Endpoint, Error, ErrorKind, Result,
        SubscriptionHandlers, Timeout,
    },
    io,
};

pub const DENDRITE_OK: c_int = 0;

/// Delivers a response or pushed message. For subscriptions a non-zero
/// return cancels the subscription; for calls the value is ignored.
pub type DendriteOnRecv = Option<unsafe extern "C" fn(*const u8, usize) -> c_int>;
/// Receives a status code and a NUL-terminated message that is only valid
/// for the duration of the callback.
pub type DendriteOnError = Option<unsafe extern "C" fn(c_int, *const c_char)>;

#[repr(C)]
pub struct DendriteRequest {
    pub topic: *const c_char,
    pub data: *const u8,
    pub size: usize,
}

/// Owned by the caller once filled in; release with
/// [`dendrite_free_response`].
#[repr(C)]
pub struct DendriteResponse {
    pub data: *mut u8,
    pub size: usize,
}

#[repr(C)]
pub struct DendriteCallParam {
    pub client: *const Client,
    pub endpoint: *const Endpoint,
    pub request: DendriteRequest,
    pub response: DendriteResponse,
    /// Microseconds, 0 waits forever.
    pub timeout: usize,
}

#[repr(C)]
pub struct DendriteAsyncParam {
    pub client: *const Client,
    pub endpoint: *const Endpoint,
    pub request: DendriteRequest,
    pub on_recv: DendriteOnRecv,
    pub on_error: DendriteOnError,
    /// Microseconds, 0 waits forever.
    pub timeout: usize,
}

#[repr(C)]
pub struct DendriteSubParam {
    pub client: *const Client,
    pub endpoint: *const Endpoint,
    pub topic: *const c_char,
    pub on_recv: DendriteOnRecv,
    pub on_error: DendriteOnError,
}

fn status(result: Result<()>) -> c_int {
    match result {
        Ok(()) => DENDRITE_OK,
        Err(e) => {
            debug!(error = %e, "ffi call failed");
            e.code()
        }
    }
}

fn timeout(us: usize) -> Timeout {
    Timeout::from_micros(us as u64)
}

unsafe fn handles<'a>(
    client: *const Client,
    endpoint: *const Endpoint,
) -> Result<(&'a Client, &'a Endpoint)> {
    match (client.as_ref(), endpoint.as_ref()) {
        (Some(client), Some(endpoint)) => Ok((client, endpoint)),
        (None, _) => Err(Error::invalid_argument("client handle is null")),
        (_, None) => Err(Error::invalid_argument("endpoint handle is null")),
    }
}

unsafe fn c_str<'a>(s: *const c_char, what: &str) -> Result<&'a str> {
    if s.is_null() {
        Err(Error::invalid_argument(format!("{what} is null")))?
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| Error::invalid_argument(format!("{what} is not UTF-8")))
}

unsafe fn request<'a>(request: &DendriteRequest) -> Result<(&'a str, &'a [u8])> {
    let topic = c_str(request.topic, "topic")?;
    if request.data.is_null() {
        Err(Error::invalid_argument("request data is null"))?
    }
    Ok((topic, slice::from_raw_parts(request.data, request.size)))
}

/// Hands `bytes` over to the caller; empty buffers stay null.
fn fill_response(response: &mut DendriteResponse, bytes: Vec<u8>) {
    let size = bytes.len();
    if size > 0 {
        let data = Box::into_raw(bytes.into_boxed_slice());
        *response = DendriteResponse {
            data: data.cast(),
            size,
        };
    }
}

/// Message text for C, with interior NULs dropped.
fn c_message(message: &str) -> CString {
    let bytes: Vec<u8> = message.bytes().filter(|b| *b != 0).collect();
    CString::new(bytes).unwrap_or_default()
}

struct ForeignSink {
    on_recv: DendriteOnRecv,
    on_error: DendriteOnError,
}

impl CompletionSink for ForeignSink {
    fn on_success(self: Box<Self>, response: Vec<u8>) {
        if let Some(on_recv) = self.on_recv {
            unsafe { on_recv(response.as_ptr(), response.len()) };
        }
    }

    fn on_error(self: Box<Self>, kind: ErrorKind, message: &str) {
        if let Some(on_error) = self.on_error {
            let message = c_message(message);
            unsafe { on_error(kind.code(), message.as_ptr()) };
        }
    }
}

#[no_mangle]
pub extern "C" fn dendrite_global_init() -> c_int {
    status(io::global_init())
}

#[no_mangle]
pub extern "C" fn dendrite_global_uninit() {
    io::global_uninit()
}

/// Returns null unless the pool is initialized.
#[no_mangle]
pub extern "C" fn dendrite_create_client() -> *mut Client {
    match Client::new() {
        Ok(client) => Box::into_raw(Box::new(client)),
        Err(e) => {
            debug!(error = %e, "client not created");
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn dendrite_release_client(client: *mut Client) {
    if !client.is_null() {
        drop(Box::from_raw(client));
    }
}

/// `addr` must be a literal IPv4 or IPv6 address. Returns null on bad
/// input or when the pool is not initialized.
#[no_mangle]
pub unsafe extern "C" fn dendrite_create_endpoint(
    addr: *const c_char,
    port: u16,
) -> *mut Endpoint {
    let endpoint = c_str(addr, "address").and_then(|addr| {
        if !io::is_initialized() {
            Err(Error::not_initialized())?
        }
        Endpoint::parse(addr, port)
    });
    match endpoint {
        Ok(endpoint) => Box::into_raw(Box::new(endpoint)),
        Err(e) => {
            debug!(error = %e, "endpoint not created");
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn dendrite_release_endpoint(endpoint: *mut Endpoint) {
    if !endpoint.is_null() {
        drop(Box::from_raw(endpoint));
    }
}

/// Blocking call. On success `param.response` owns the response, on a
/// remote failure the peer's diagnostic payload if it sent one. Either way
/// the buffer is allocated by this library and the caller must hand it
/// back to [`dendrite_free_response`]. Other failures leave it empty.
#[no_mangle]
pub unsafe extern "C" fn dendrite_call(
    param: *mut DendriteCallParam,
) -> c_int {
    let Some(param) = param.as_mut() else {
        return ErrorKind::InvalidArgument.code();
    };
    param.response = DendriteResponse {
        data: ptr::null_mut(),
        size: 0,
    };
    let outcome =
        handles(param.client, param.endpoint).and_then(|(client, endpoint)| {
            let (topic, payload) = request(&param.request)?;
            client.call(endpoint, topic, payload, timeout(param.timeout))
        });
    match outcome {
        Ok(response) => {
            fill_response(&mut param.response, response);
            DENDRITE_OK
        }
        Err(e) => {
            debug!(error = %e, "ffi call failed");
            let code = e.code();
            if let Some(partial) = e.into_partial() {
                fill_response(&mut param.response, partial);
            }
            code
        }
    }
}

/// Blocking publish; returns once the message is sent. The response field
/// is left untouched.
#[no_mangle]
pub unsafe extern "C" fn dendrite_pub(param: *mut DendriteCallParam) -> c_int {
    let Some(param) = param.as_ref() else {
        return ErrorKind::InvalidArgument.code();
    };
    status(handles(param.client, param.endpoint).and_then(|(client, endpoint)| {
        let (topic, payload) = request(&param.request)?;
        client.publish(endpoint, topic, payload, timeout(param.timeout))
    }))
}

unsafe fn async_send(param: *const DendriteAsyncParam, publish: bool) -> c_int {
    let Some(param) = param.as_ref() else {
        return ErrorKind::InvalidArgument.code();
    };
    status(handles(param.client, param.endpoint).and_then(|(client, endpoint)| {
        let (topic, payload) = request(&param.request)?;
        let sink = ForeignSink {
            on_recv: param.on_recv,
            on_error: param.on_error,
        };
        let timeout = timeout(param.timeout);
        if publish {
            client.async_publish(endpoint, topic, payload, timeout, sink)
        } else {
            client.async_call(endpoint, topic, payload, timeout, sink)
        }
    }))
}

/// Returns as soon as the call is scheduled. Exactly one of `on_recv` and
/// `on_error` fires later, on a pool thread. The buffer passed to
/// `on_recv` is only valid during the callback.
#[no_mangle]
pub unsafe extern "C" fn dendrite_async_call(
    param: *const DendriteAsyncParam,
) -> c_int {
    async_send(param, false)
}

/// `on_recv` fires with an empty buffer once the message is sent.
#[no_mangle]
pub unsafe extern "C" fn dendrite_async_pub(
    param: *const DendriteAsyncParam,
) -> c_int {
    async_send(param, true)
}

/// Subscribes and returns once the request is sent. `on_recv` fires for
/// every pushed message until it returns non-zero, the subscription is
/// replaced or [`dendrite_unsub`] is called.
#[no_mangle]
pub unsafe extern "C" fn dendrite_async_sub(
    param: *const DendriteSubParam,
) -> c_int {
    let Some(param) = param.as_ref() else {
        return ErrorKind::InvalidArgument.code();
    };
    status(handles(param.client, param.endpoint).and_then(|(client, endpoint)| {
        let topic = c_str(param.topic, "topic")?;
        let mut handlers = SubscriptionHandlers::new();
        if let Some(on_recv) = param.on_recv {
            handlers = handlers.on_message(move |payload: &[u8]| {
                match unsafe { on_recv(payload.as_ptr(), payload.len()) } {
                    0 => Delivery::Continue,
                    _ => Delivery::Cancel,
                }
            });
        }
        if let Some(on_error) = param.on_error {
            handlers = handlers.on_error(move |kind: ErrorKind, message: &str| {
                let message = c_message(message);
                unsafe { on_error(kind.code(), message.as_ptr()) };
            });
        }
        client.subscribe(endpoint, topic, handlers).map(drop)
    }))
}

/// Cancels the subscription for the client, endpoint and topic in `param`.
/// Unsubscribing twice is not an error. Callbacks are ignored.
#[no_mangle]
pub unsafe extern "C" fn dendrite_unsub(param: *const DendriteSubParam) -> c_int {
    let Some(param) = param.as_ref() else {
        return ErrorKind::InvalidArgument.code();
    };
    status(handles(param.client, param.endpoint).and_then(|(client, endpoint)| {
        let topic = c_str(param.topic, "topic")?;
        client.unsubscribe(endpoint, topic);
        Ok(())
    }))
}

/// Releases a buffer filled in by [`dendrite_call`] and resets the
/// response. Safe to call on an empty or already freed response.
#[no_mangle]
pub unsafe extern "C" fn dendrite_free_response(response: *mut DendriteResponse) {
    let Some(response) = response.as_mut() else {
        return;
    };
    if !response.data.is_null() {
        let data = ptr::slice_from_raw_parts_mut(response.data, response.size);
        drop(Box::from_raw(data));
    }
    response.data = ptr::null_mut();
    response.size = 0;
}
