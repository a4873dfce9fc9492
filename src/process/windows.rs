//! Windows-only pieces of the process runner: error dialog suppression,
//! OutputDebugString capture and the parent-process watchdog.

use crossbeam_channel::Sender;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0};
use windows_sys::Win32::System::Diagnostics::Debug::{
    SetErrorMode, SEM_FAILCRITICALERRORS, SEM_NOGPFAULTERRORBOX, SEM_NOOPENFILEERRORBOX,
};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W, TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, GetCurrentProcessId, OpenProcess, SetEvent, WaitForSingleObject,
    PROCESS_SYNCHRONIZE,
};

use super::{decode_line, Stream};

const DBWIN_BUFFER_SIZE: usize = 4096;

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Keep crash and missing-DLL dialogs from blocking unattended children.
/// The mode is inherited by processes spawned afterwards.
pub(super) fn disable_error_dialogs() {
    unsafe {
        SetErrorMode(SEM_FAILCRITICALERRORS | SEM_NOGPFAULTERRORBOX | SEM_NOOPENFILEERRORBOX);
    }
}

/// Listener on the system-wide `DBWIN_BUFFER` shared memory.
///
/// Created before the child is spawned so no early message is lost.
pub(super) struct DebugStringCapture {
    buffer_ready: HANDLE,
    data_ready: HANDLE,
    mapping: HANDLE,
    view: usize,
}

// The handles and the mapped view are only touched by the capture thread
// once it is started.
unsafe impl Send for DebugStringCapture {}

impl DebugStringCapture {
    /// `None` when another debugger already owns the buffer.
    pub(super) fn create() -> Option<Self> {
        unsafe {
            let buffer_ready = CreateEventW(ptr::null(), 0, 0, wide("DBWIN_BUFFER_READY").as_ptr());
            let data_ready = CreateEventW(ptr::null(), 0, 0, wide("DBWIN_DATA_READY").as_ptr());
            let mapping = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE,
                0,
                DBWIN_BUFFER_SIZE as u32,
                wide("DBWIN_BUFFER").as_ptr(),
            );
            if buffer_ready == 0 || data_ready == 0 || mapping == 0 {
                tracing::debug!("OutputDebugString capture unavailable");
                for handle in [buffer_ready, data_ready, mapping] {
                    if handle != 0 {
                        CloseHandle(handle);
                    }
                }
                return None;
            }
            let view = MapViewOfFile(mapping, FILE_MAP_READ, 0, 0, 0);
            if view.Value.is_null() {
                CloseHandle(buffer_ready);
                CloseHandle(data_ready);
                CloseHandle(mapping);
                return None;
            }
            Some(Self {
                buffer_ready,
                data_ready,
                mapping,
                view: view.Value as usize,
            })
        }
    }

    /// Forward messages written by `pid` to `tx` until stopped.
    pub(super) fn start(self, pid: u32, tx: Sender<(Stream, String)>) -> RunningCapture {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            let capture = self;
            while !flag.load(Ordering::SeqCst) {
                unsafe {
                    SetEvent(capture.buffer_ready);
                    if WaitForSingleObject(capture.data_ready, 100) != WAIT_OBJECT_0 {
                        continue;
                    }
                    let base = capture.view as *const u8;
                    let sender = ptr::read_unaligned(base as *const u32);
                    if sender != pid {
                        continue;
                    }
                    let data = std::slice::from_raw_parts(base.add(4), DBWIN_BUFFER_SIZE - 4);
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    for line in data[..end].split(|&b| b == b'\n') {
                        let text = decode_line(line);
                        if text.is_empty() {
                            continue;
                        }
                        if tx.send((Stream::Debug, text)).is_err() {
                            return;
                        }
                    }
                }
            }
        });
        RunningCapture { stop, worker }
    }
}

impl Drop for DebugStringCapture {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.view as *mut _,
            });
            CloseHandle(self.mapping);
            CloseHandle(self.data_ready);
            CloseHandle(self.buffer_ready);
        }
    }
}

pub(super) struct RunningCapture {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl RunningCapture {
    pub(super) fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.worker.join();
    }
}

fn parent_process_id() -> Option<u32> {
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            return None;
        }
        let current = GetCurrentProcessId();
        let mut entry: PROCESSENTRY32W = std::mem::zeroed();
        entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;
        let mut found = None;
        let mut ok = Process32FirstW(snapshot, &mut entry);
        while ok != 0 {
            if entry.th32ProcessID == current {
                found = Some(entry.th32ParentProcessID);
                break;
            }
            ok = Process32NextW(snapshot, &mut entry);
        }
        CloseHandle(snapshot);
        found
    }
}

/// Raise `gone` when the parent process exits before `done` is set.
pub(super) fn watch_parent(done: Arc<AtomicBool>, gone: Arc<AtomicBool>) {
    let Some(parent) = parent_process_id() else {
        return;
    };
    let handle = unsafe { OpenProcess(PROCESS_SYNCHRONIZE, 0, parent) };
    if handle == 0 {
        return;
    }
    let handle = handle as isize;
    thread::spawn(move || {
        let handle = handle as HANDLE;
        while !done.load(Ordering::SeqCst) {
            if unsafe { WaitForSingleObject(handle, 500) } == WAIT_OBJECT_0 {
                gone.store(true, Ordering::SeqCst);
                break;
            }
        }
        unsafe {
            CloseHandle(handle);
        }
    });
}
