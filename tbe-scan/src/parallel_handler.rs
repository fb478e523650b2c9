//! A thread pool which runs a closure in parallel over a stream of inputs.
//!
//! Carried over from the teacher's generic `tools::parallel_handler` as-is —
//! both the Source Scanner's directory workers and the Checksum Worker Pool
//! are instances of this same shape.3/§4.4.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Sender};

pub struct SendHandle<I> {
    input: Sender<I>,
    abort: Arc<Mutex<Option<String>>>,
}

pub fn check_abort(abort: &Mutex<Option<String>>) -> Result<(), Error> {
    let guard = abort.lock().unwrap();
    if let Some(err_msg) = &*guard {
        return Err(format_err!("{}", err_msg));
    }
    Ok(())
}

impl<I: Send> SendHandle<I> {
    pub fn send(&self, input: I) -> Result<(), Error> {
        check_abort(&self.abort)?;
        match self.input.send(input) {
            Ok(()) => Ok(()),
            Err(_) => bail!("send failed - channel closed"),
        }
    }
}

impl<I> Clone for SendHandle<I> {
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            abort: Arc::clone(&self.abort),
        }
    }
}

/// Runs `handler_fn` on `threads` worker threads, each pulling from a shared
/// bounded channel. The first error any worker returns is latched and
/// surfaced by `complete()`; further sends are rejected once that happens.
pub struct ParallelHandler<I> {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: Option<SendHandle<I>>,
}

impl<I: Send + 'static> ParallelHandler<I> {
    pub fn new<F>(name: &str, threads: usize, handler_fn: F) -> Self
    where
        F: Fn(I) -> Result<(), Error> + Send + Clone + 'static,
    {
        let mut handles = Vec::new();
        let (input_tx, input_rx) = bounded::<I>(threads.max(1));
        let abort = Arc::new(Mutex::new(None));

        for i in 0..threads.max(1) {
            let input_rx = input_rx.clone();
            let abort = Arc::clone(&abort);
            let handler_fn = handler_fn.clone();

            handles.push(
                std::thread::Builder::new()
                    .name(format!("{name} ({i})"))
                    .spawn(move || loop {
                        let data = match input_rx.recv() {
                            Ok(data) => data,
                            Err(_) => return,
                        };
                        if let Err(err) = (handler_fn)(data) {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    })
                    .unwrap(),
            );
        }
        Self {
            handles,
            name: name.to_string(),
            input: Some(SendHandle {
                input: input_tx,
                abort,
            }),
        }
    }

    pub fn channel(&self) -> SendHandle<I> {
        self.input.as_ref().unwrap().clone()
    }

    pub fn send(&self, input: I) -> Result<(), Error> {
        self.input.as_ref().unwrap().send(input)?;
        Ok(())
    }

    pub fn complete(mut self) -> Result<(), Error> {
        let input = self.input.take().unwrap();
        let abort = Arc::clone(&input.abort);
        check_abort(&abort)?;
        drop(input);

        let msg_list = self.join_threads();
        check_abort(&abort)?;

        if msg_list.is_empty() {
            return Ok(());
        }
        Err(format_err!("{}", msg_list.join("\n")))
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut msg_list = Vec::new();
        let mut i = 0;
        while let Some(handle) = self.handles.pop() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(panic_msg) => {
                        msg_list.push(format!("thread {} ({}) panicked: {}", self.name, i, panic_msg))
                    }
                    Err(_) => msg_list.push(format!("thread {} ({}) panicked", self.name, i)),
                }
            }
            i += 1;
        }
        msg_list
    }
}

impl<I> Drop for ParallelHandler<I> {
    fn drop(&mut self) {
        drop(self.input.take());
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn runs_all_inputs_across_workers() {
        let total = Arc::new(AtomicU64::new(0));
        let total_clone = Arc::clone(&total);
        let handler = ParallelHandler::new("test", 4, move |n: u64| {
            total_clone.fetch_add(n, Ordering::SeqCst);
            Ok(())
        });
        for n in 1..=100u64 {
            handler.send(n).unwrap();
        }
        handler.complete().unwrap();
        assert_eq!(total.load(Ordering::SeqCst), (1..=100).sum());
    }

    #[test]
    fn first_error_is_surfaced_by_complete() {
        let handler = ParallelHandler::new("test", 2, |n: u64| {
            if n == 3 {
                bail!("boom");
            }
            Ok(())
        });
        for n in 1..=10u64 {
            let _ = handler.send(n);
        }
        assert!(handler.complete().is_err());
    }
}
