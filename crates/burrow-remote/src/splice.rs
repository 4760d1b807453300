//! Bidirectional copy between an attach connection and a task.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use burrow_runtime::Attacher;

/// Longest a copy worker blocks before re-checking the stop flags.
const SLICE: Duration = Duration::from_millis(100);

const BUF_LEN: usize = 8192;

/// Copies `conn` into the task and the task's output into `conn` until
/// either side is done or `stop` is raised.
///
/// End of input from the connection half-closes the task's stdin and
/// keeps output flowing; end of task output, a connection error, or
/// `stop` ends both directions and shuts the connection down.
///
/// # Errors
///
/// Returns an error if either handle cannot be duplicated or configured.
pub fn splice(conn: &TcpStream, attacher: &mut dyn Attacher, stop: &AtomicBool) -> io::Result<()> {
    let mut conn_in = conn.try_clone()?;
    let mut conn_out = conn.try_clone()?;
    let mut task_out = attacher.try_clone()?;
    conn_in.set_read_timeout(Some(SLICE))?;
    conn_out.set_write_timeout(Some(SLICE))?;
    task_out.set_read_timeout(Some(SLICE))?;
    attacher.set_write_timeout(Some(SLICE))?;
    let done = AtomicBool::new(false);
    let finished = || done.load(Ordering::Acquire) || stop.load(Ordering::Acquire);

    std::thread::scope(|scope| {
        let _ = scope.spawn(|| {
            let mut buf = [0_u8; BUF_LEN];
            while !finished() {
                match conn_in.read(&mut buf) {
                    Ok(0) => {
                        let _ = attacher.close_write();
                        return;
                    }
                    Ok(n) => {
                        if !write_fully(attacher, &buf[..n], &finished) {
                            return;
                        }
                    }
                    Err(e) if is_retry(&e) => {}
                    Err(_) => break,
                }
            }
            done.store(true, Ordering::Release);
        });

        let mut buf = [0_u8; BUF_LEN];
        while !finished() {
            match task_out.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if !write_fully(&mut conn_out, &buf[..n], &finished) {
                        break;
                    }
                }
                Err(e) if is_retry(&e) => {}
                Err(_) => break,
            }
        }
        done.store(true, Ordering::Release);
        let _ = conn_out.shutdown(Shutdown::Both);
    });
    Ok(())
}

/// Writes all of `buf`, retrying timed-out writes until `finished` says
/// the session is over. Returns whether everything was written.
fn write_fully(out: &mut (impl Write + ?Sized), mut buf: &[u8], finished: &impl Fn() -> bool) -> bool {
    while !buf.is_empty() {
        match out.write(buf) {
            Ok(0) => return false,
            Ok(n) => buf = &buf[n..],
            Err(e) if is_retry(&e) => {
                if finished() {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}

fn is_retry(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
