//! `sim watch`: redraw the simulation table on a fixed interval.
//!
//! Each poll overwrites the previous frame. A failed poll is drawn as an
//! error line and the next tick tries again; only the cancel future ends
//! the loop, also while a request is in flight.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use crate::client::{ApiClient, CliError};
use crate::view::{self, SimulationSummary};

/// Clear the screen and home the cursor.
pub const CLEAR: &str = "\x1b[2J\x1b[H";

/// Poll every `every` until `cancel` resolves, drawing frames to `out`.
///
/// # Errors
///
/// Returns `Io` if a frame cannot be written.
pub async fn run<F, W>(
    client: &ApiClient,
    id: Option<&str>,
    every: Duration,
    cancel: F,
    out: &mut W,
) -> Result<(), CliError>
where
    F: Future,
    W: Write,
{
    let mut ticker = tokio::time::interval(every);
    tokio::pin!(cancel);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut cancel => return Ok(()),
        }
        let polled = tokio::select! {
            polled = poll(client, id) => polled,
            _ = &mut cancel => return Ok(()),
        };

        let frame = match polled {
            Ok(sims) => view::render_table(&sims),
            Err(e) => format!("error: {e}\n"),
        };
        write!(out, "{CLEAR}{frame}")
            .and_then(|()| out.flush())
            .map_err(|source| CliError::Io { path: "stdout".into(), source })?;
    }
}

async fn poll(client: &ApiClient, id: Option<&str>) -> Result<Vec<SimulationSummary>, CliError> {
    match id {
        Some(id) => Ok(vec![client.get_json(&format!("/simulation/{id}"), "error getting simulation").await?]),
        None => client.get_json("/simulation", "error listing simulations").await,
    }
}

#[cfg(test)]
#[path = "watch_test.rs"]
mod tests;
