//! `burrowd attach` — Connect the terminal to a task's stdio.

use std::io::{self, Read, Write};

use burrow_runtime::Manager;
use clap::Args;

/// Arguments for the `attach` command.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Container id.
    pub id: String,

    /// Task id.
    pub task: String,
}

/// Copies local stdin to the task and the task's output to stdout until
/// the task closes its output. End of local input half-closes the task's
/// stdin.
///
/// # Errors
///
/// Returns an error if the attach handshake or the output copy fails.
pub fn execute(manager: &dyn Manager, args: &AttachArgs) -> anyhow::Result<()> {
    let mut attacher = manager.get(&args.id)?.attach(&args.task)?;
    let mut input = attacher.try_clone()?;

    let _ = std::thread::Builder::new()
        .name("attach-stdin".into())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = [0_u8; 4096];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if input.write_all(&buf[..n]).is_err() {
                            return;
                        }
                    }
                }
            }
            if let Err(e) = input.close_write() {
                tracing::debug!(error = %e, "half-close failed");
            }
        })?;

    let mut stdout = io::stdout().lock();
    let _ = io::copy(&mut attacher, &mut stdout)?;
    stdout.flush()?;
    Ok(())
}
