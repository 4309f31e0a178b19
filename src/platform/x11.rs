use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::instrument;
use xcb::{
    screensaver::{QueryInfo, QueryInfoReply},
    x::{Drawable, GetImage, ImageFormat, Window},
    Connection, Extension,
};

use super::{bgrx_to_rgba, idle::IdleTimeSource, RawFrame, ScreenCapturer};

fn root_window(conn: &Connection, screen_num: usize) -> Result<(Window, u16, u16)> {
    let screen = conn
        .get_setup()
        .roots()
        .nth(screen_num)
        .ok_or_else(|| anyhow!("Screen {screen_num} is not available"))?;
    Ok((
        screen.root(),
        screen.width_in_pixels(),
        screen.height_in_pixels(),
    ))
}

/// Grabs the root window of the default screen.
pub struct LinuxScreenCapturer {
    conn: Connection,
    screen_num: usize,
}

impl LinuxScreenCapturer {
    pub fn new() -> Result<Self> {
        let (conn, screen_num) = Connection::connect(None)?;
        Ok(Self {
            conn,
            screen_num: screen_num as usize,
        })
    }
}

impl ScreenCapturer for LinuxScreenCapturer {
    #[instrument(skip(self))]
    fn capture_frame(&mut self) -> Result<RawFrame> {
        let (root, width, height) = root_window(&self.conn, self.screen_num)?;
        let reply = self.conn.wait_for_reply(self.conn.send_request(&GetImage {
            format: ImageFormat::ZPixmap,
            drawable: Drawable::Window(root),
            x: 0,
            y: 0,
            width,
            height,
            plane_mask: u32::MAX,
        }))?;

        let expected = usize::from(width) * usize::from(height) * 4;
        if reply.depth() < 24 || reply.data().len() < expected {
            return Err(anyhow!(
                "Unsupported root window format, depth {} with {} bytes",
                reply.depth(),
                reply.data().len()
            ));
        }

        Ok(RawFrame {
            width: u32::from(width),
            height: u32::from(height),
            rgba: bgrx_to_rgba(reply.data()[..expected].to_vec()),
        })
    }
}

/// Reads the MIT-SCREEN-SAVER idle counter of the default screen.
pub struct LinuxIdleTimeSource {
    conn: Connection,
    screen_num: usize,
}

impl LinuxIdleTimeSource {
    pub fn new() -> Result<Self> {
        let (conn, screen_num) =
            Connection::connect_with_extensions(None, &[Extension::ScreenSaver], &[])?;
        Ok(Self {
            conn,
            screen_num: screen_num as usize,
        })
    }
}

impl IdleTimeSource for LinuxIdleTimeSource {
    #[instrument(skip(self))]
    fn idle_time(&mut self) -> Result<Duration> {
        let (root, _, _) = root_window(&self.conn, self.screen_num)?;
        let idle = self.conn.send_request(&QueryInfo {
            drawable: Drawable::Window(root),
        });
        let reply: QueryInfoReply = self.conn.wait_for_reply(idle)?;
        Ok(Duration::from_millis(u64::from(reply.ms_since_user_input())))
    }
}
