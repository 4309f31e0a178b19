use std::{ffi::c_void, time::Duration};

use anyhow::{anyhow, Result};
use tracing::{error, instrument};
use windows::Win32::{
    Foundation::HWND,
    Graphics::Gdi::{
        BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC,
        GetDIBits, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS,
        SRCCOPY,
    },
    System::SystemInformation::GetTickCount64,
    UI::{
        Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO},
        WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN},
    },
};

use super::{bgrx_to_rgba, idle::IdleTimeSource, RawFrame, ScreenCapturer};

/// Copies the primary display through GDI.
pub struct WindowsScreenCapturer;

impl WindowsScreenCapturer {
    pub fn new() -> Self {
        Self
    }
}

impl ScreenCapturer for WindowsScreenCapturer {
    #[instrument(skip(self))]
    fn capture_frame(&mut self) -> Result<RawFrame> {
        let width = unsafe { GetSystemMetrics(SM_CXSCREEN) };
        let height = unsafe { GetSystemMetrics(SM_CYSCREEN) };
        if width <= 0 || height <= 0 {
            return Err(anyhow!("Failed to get screen size"));
        }

        let screen = unsafe { GetDC(HWND::default()) };
        if screen.is_invalid() {
            return Err(anyhow!("Failed to get screen device context"));
        }
        let memory = unsafe { CreateCompatibleDC(screen) };
        let bitmap = unsafe { CreateCompatibleBitmap(screen, width, height) };
        let previous = unsafe { SelectObject(memory, bitmap) };

        let mut info = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: width,
                // Negative height gives top-down rows.
                biHeight: -height,
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut buffer = vec![0u8; width as usize * height as usize * 4];

        let copied = unsafe { BitBlt(memory, 0, 0, width, height, screen, 0, 0, SRCCOPY) }
            .inspect_err(|e| error!("Failed to copy screen {e:?}"));
        let lines = if copied.is_ok() {
            unsafe {
                GetDIBits(
                    memory,
                    bitmap,
                    0,
                    height as u32,
                    Some(buffer.as_mut_ptr() as *mut c_void),
                    &mut info,
                    DIB_RGB_COLORS,
                )
            }
        } else {
            0
        };

        unsafe {
            SelectObject(memory, previous);
            let _ = DeleteObject(bitmap);
            let _ = DeleteDC(memory);
            ReleaseDC(HWND::default(), screen);
        }

        copied?;
        if lines != height {
            return Err(anyhow!("Failed to read screen bitmap, got {lines} lines"));
        }

        Ok(RawFrame {
            width: width as u32,
            height: height as u32,
            rgba: bgrx_to_rgba(buffer),
        })
    }
}

/// Idle time from `GetLastInputInfo`, relative to the system tick count.
pub struct WindowsIdleTimeSource;

impl IdleTimeSource for WindowsIdleTimeSource {
    fn idle_time(&mut self) -> Result<Duration> {
        let mut last = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };
        let is_success = unsafe { GetLastInputInfo(&mut last) };
        if !is_success.as_bool() {
            error!("Failed to retrieve user idle time");
            return Err(anyhow!("Failed to retrieve user idle time"));
        }

        // dwTime wraps every 49.7 days, compare in the same 32 bit space.
        let tick_count = unsafe { GetTickCount64() } as u32;
        Ok(Duration::from_millis(u64::from(
            tick_count.wrapping_sub(last.dwTime),
        )))
    }
}
