//! The buffered dispatch engine: owns the four admission-controlled queues,
//! the callback fan-out, and the three-tier prioritized write loop.
//!
//! Grounded in `original_source/buffer/buffer.go`'s `Buffer` type. Each
//! long-lived component is its own OS thread, matching the Go source's
//! goroutine-per-component structure one-to-one (`readLoop`, `loop`,
//! `callbackLoop`, `pollLoop`).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info_span, warn};

use crate::flow::FlowConfig;
use crate::handler::Handler;
use crate::queue::Queue;
use crate::scanner::{tokenize_all, Scanner};
use crate::types::{CommandResponse, QueueItem};
use crate::{Error, Result};

/// The shared submission path: splits/tokenizes a client command and
/// pushes the resulting items onto the appropriate admission queue. Used
/// both by [`Engine::queue_command`] and the poll task, so a Handler's
/// `poll_command` is subject to the exact same classification as any other
/// caller submission.
struct Submitter {
    flow: Arc<FlowConfig>,
    ctrl_tx: Sender<String>,
    write_q: Arc<Queue<QueueItem>>,
    priority_q: Arc<Queue<QueueItem>>,
    meta_q: Arc<Queue<QueueItem>>,
    on_update_q: Arc<Queue<CommandResponse>>,
}

impl Submitter {
    fn queue_command(&self, id: &str, data: &str) -> Result<()> {
        let (ctrl_chars, data) = (self.flow.split_control_chars)(data);
        for chr in ctrl_chars {
            self.ctrl_tx.send(chr.to_string()).map_err(|_| Error::Closed)?;
        }

        let lines = tokenize_all(&self.flow.send_split, data.as_bytes())?
            .into_iter()
            .map(|l| String::from_utf8_lossy(&l).into_owned())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>();

        match lines.len() {
            0 => Ok(()),
            1 => self.queue_line(QueueItem {
                id: id.to_string(),
                data: lines.into_iter().next().unwrap(),
                seq: 1,
                seq_max: 1,
            }),
            n => {
                for (i, line) in lines.into_iter().enumerate() {
                    self.queue_line(QueueItem {
                        id: id.to_string(),
                        data: line,
                        seq: i + 1,
                        seq_max: n,
                    })?;
                }
                Ok(())
            }
        }
    }

    fn queue_line(&self, mut item: QueueItem) -> Result<()> {
        if (self.flow.is_meta)(&item.data) {
            return self.meta_q.push(item);
        }

        item.data = (self.flow.wrap_input)(&item.data);
        self.on_update_q.push(CommandResponse::Queued(item.clone())).ok();

        if (self.flow.is_control)(&item.data) {
            self.priority_q.push(item)
        } else {
            self.write_q.push(item)
        }
    }
}

/// The buffered I/O engine for a single device connection.
///
/// Constructed via [`crate::EngineBuilder`]. Cloning an `Engine` is cheap
/// (it is a handle to shared, actor-owned state); the last clone dropped
/// joins the background threads.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    submitter: Submitter,
    write_q: Arc<Queue<QueueItem>>,
    priority_q: Arc<Queue<QueueItem>>,
    meta_q: Arc<Queue<QueueItem>>,
    closed: AtomicBool,
    shutdown_tx: Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub(crate) fn spawn<R, W>(
        reader: R,
        writer: W,
        handler: Arc<dyn Handler>,
        on_read: Arc<dyn Fn(String) + Send + Sync>,
        on_update: Arc<dyn Fn(CommandResponse) + Send + Sync>,
        poll_interval: Option<Duration>,
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let flow = Arc::new(handler.flow_config());

        let write_q = Arc::new(Queue::new());
        let priority_q = Arc::new(Queue::new());
        let read_q = Arc::new(Queue::<String>::new());
        let meta_q = Arc::new(Queue::new());
        let on_read_q = Arc::new(Queue::<String>::new());
        let on_update_q = Arc::new(Queue::<CommandResponse>::new());

        {
            let handler = handler.clone();
            let _ = write_q.set_condition(Some(Arc::new(move |item: &QueueItem| {
                handler.check_buffer(item)
            })));
        }
        {
            let handler = handler.clone();
            let _ = priority_q.set_condition(Some(Arc::new(move |item: &QueueItem| {
                handler.check_buffer(item)
            })));
        }

        let (ctrl_tx, ctrl_rx) = bounded::<String>(0);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let submitter = Submitter {
            flow: flow.clone(),
            ctrl_tx,
            write_q: write_q.clone(),
            priority_q: priority_q.clone(),
            meta_q: meta_q.clone(),
            on_update_q: on_update_q.clone(),
        };

        let mut handles = Vec::with_capacity(4);

        handles.push(Self::spawn_reader(reader, flow.clone(), read_q.clone()));

        handles.push(Self::spawn_dispatch(
            writer,
            handler.clone(),
            flow,
            write_q.clone(),
            priority_q.clone(),
            read_q,
            meta_q.clone(),
            on_read_q.clone(),
            on_update_q.clone(),
            ctrl_rx,
            shutdown_rx.clone(),
        ));

        handles.push(Self::spawn_callback(on_read_q, on_update_q, on_read, on_update));

        if let Some(interval) = poll_interval {
            let poll_submitter = Submitter {
                flow: submitter.flow.clone(),
                ctrl_tx: submitter.ctrl_tx.clone(),
                write_q: submitter.write_q.clone(),
                priority_q: submitter.priority_q.clone(),
                meta_q: submitter.meta_q.clone(),
                on_update_q: submitter.on_update_q.clone(),
            };
            handles.push(Self::spawn_poll(interval, handler, poll_submitter, shutdown_rx));
        }

        Self {
            inner: Arc::new(Inner {
                submitter,
                write_q,
                priority_q,
                meta_q,
                closed: AtomicBool::new(false),
                shutdown_tx,
                handles: Mutex::new(handles),
            }),
        }
    }

    fn spawn_reader<R>(reader: R, flow: Arc<FlowConfig>, read_q: Arc<Queue<String>>) -> JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        std::thread::Builder::new()
            .name("flowport-reader".into())
            .spawn(move || {
                let span = info_span!("flowport_reader");
                let _enter = span.enter();
                let mut scanner =
                    Scanner::new(reader, Box::new(move |data, at_eof| (flow.recv_split)(data, at_eof)));
                loop {
                    match scanner.next_token() {
                        Ok(Some(token)) => {
                            let line = String::from_utf8_lossy(&token).into_owned();
                            if line.is_empty() {
                                continue;
                            }
                            if read_q.push(line).is_err() {
                                debug!("read queue closed, reader exiting");
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!("device stream reached eof, reader exiting");
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "reader error, reader exiting");
                            return;
                        }
                    }
                }
            })
            .expect("spawn reader thread")
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_dispatch<W>(
        mut writer: W,
        handler: Arc<dyn Handler>,
        flow: Arc<FlowConfig>,
        write_q: Arc<Queue<QueueItem>>,
        priority_q: Arc<Queue<QueueItem>>,
        read_q: Arc<Queue<String>>,
        meta_q: Arc<Queue<QueueItem>>,
        on_read_q: Arc<Queue<String>>,
        on_update_q: Arc<Queue<CommandResponse>>,
        ctrl_rx: Receiver<String>,
        shutdown_rx: Receiver<()>,
    ) -> JoinHandle<()>
    where
        W: Write + Send + 'static,
    {
        std::thread::Builder::new()
            .name("flowport-dispatch".into())
            .spawn(move || {
                let span = info_span!("flowport_dispatch");
                let _enter = span.enter();

                let handle_write = |item: QueueItem, writer: &mut W| -> Result<()> {
                    writer.write_all(item.data.as_bytes())?;
                    writer.flush()?;
                    on_update_q.push(CommandResponse::Sent(item.clone())).ok();
                    for resp in handler.handle_input(&item) {
                        on_update_q.push(resp).ok();
                    }

                    if (flow.is_buffer_reset)(&item.data) {
                        let mut removed = priority_q.reset();
                        removed.extend(write_q.reset());
                        for r in removed {
                            on_update_q.push(CommandResponse::Error(r, Error::Reset)).ok();
                        }
                        for resp in handler.apply_reset_filter(&|_| false) {
                            on_update_q.push(resp).ok();
                        }
                    } else if let Some(keep) = (flow.is_partial_buffer_reset)(&item.data) {
                        let keep_for_priority = keep.clone();
                        let keep_for_write = keep.clone();
                        let mut removed =
                            priority_q.filter(move |it: &QueueItem| keep_for_priority(it));
                        removed.extend(write_q.filter(move |it: &QueueItem| keep_for_write(it)));
                        for r in removed {
                            on_update_q.push(CommandResponse::Error(r, Error::Reset)).ok();
                        }
                        let keep_ref: &dyn Fn(&QueueItem) -> bool = keep.as_ref();
                        for resp in handler.apply_reset_filter(keep_ref) {
                            on_update_q.push(resp).ok();
                        }
                    }
                    Ok(())
                };

                let handle_read = |line: String| {
                    on_read_q.push(format!("{line}\n")).ok();
                    for resp in handler.handle_response(&line) {
                        on_update_q.push(resp).ok();
                    }
                };

                let handle_meta = |item: QueueItem| {
                    if let Some(resp) = handler.handle_meta(&item.data) {
                        if !resp.is_empty() {
                            on_read_q.push(format!("{resp}\n")).ok();
                        }
                    }
                };

                'dispatch: loop {
                    priority_q.re_check();
                    write_q.re_check();

                    select! {
                        recv(shutdown_rx) -> _ => break 'dispatch,
                        recv(ctrl_rx) -> msg => match msg {
                            Ok(chr) => { let _ = handle_write(QueueItem::new("", chr), &mut writer); continue 'dispatch; }
                            Err(_) => break 'dispatch,
                        },
                        recv(meta_q.data()) -> msg => match msg {
                            Ok(item) => { handle_meta(item); continue 'dispatch; }
                            Err(_) => break 'dispatch,
                        },
                        recv(read_q.data()) -> msg => match msg {
                            Ok(line) => { handle_read(line); continue 'dispatch; }
                            Err(_) => break 'dispatch,
                        },
                        default => {}
                    }

                    select! {
                        recv(shutdown_rx) -> _ => break 'dispatch,
                        recv(ctrl_rx) -> msg => match msg {
                            Ok(chr) => { let _ = handle_write(QueueItem::new("", chr), &mut writer); continue 'dispatch; }
                            Err(_) => break 'dispatch,
                        },
                        recv(meta_q.data()) -> msg => match msg {
                            Ok(item) => { handle_meta(item); continue 'dispatch; }
                            Err(_) => break 'dispatch,
                        },
                        recv(priority_q.data()) -> msg => match msg {
                            Ok(item) => {
                                if let Err(e) = handle_write(item, &mut writer) {
                                    error!(error = %e, "fatal write error, dispatch exiting");
                                    break 'dispatch;
                                }
                                continue 'dispatch;
                            }
                            Err(_) => break 'dispatch,
                        },
                        recv(read_q.data()) -> msg => match msg {
                            Ok(line) => { handle_read(line); continue 'dispatch; }
                            Err(_) => break 'dispatch,
                        },
                        default => {}
                    }

                    select! {
                        recv(shutdown_rx) -> _ => break 'dispatch,
                        recv(ctrl_rx) -> msg => match msg {
                            Ok(chr) => { let _ = handle_write(QueueItem::new("", chr), &mut writer); }
                            Err(_) => break 'dispatch,
                        },
                        recv(priority_q.data()) -> msg => match msg {
                            Ok(item) => {
                                if let Err(e) = handle_write(item, &mut writer) {
                                    error!(error = %e, "fatal write error, dispatch exiting");
                                    break 'dispatch;
                                }
                            }
                            Err(_) => break 'dispatch,
                        },
                        recv(write_q.data()) -> msg => match msg {
                            Ok(item) => {
                                if let Err(e) = handle_write(item, &mut writer) {
                                    error!(error = %e, "fatal write error, dispatch exiting");
                                    break 'dispatch;
                                }
                            }
                            Err(_) => break 'dispatch,
                        },
                        recv(read_q.data()) -> msg => match msg {
                            Ok(line) => handle_read(line),
                            Err(_) => break 'dispatch,
                        },
                        recv(meta_q.data()) -> msg => match msg {
                            Ok(item) => handle_meta(item),
                            Err(_) => break 'dispatch,
                        },
                    }
                }
                debug!("dispatch loop exiting");
            })
            .expect("spawn dispatch thread")
    }

    fn spawn_callback(
        on_read_q: Arc<Queue<String>>,
        on_update_q: Arc<Queue<CommandResponse>>,
        on_read: Arc<dyn Fn(String) + Send + Sync>,
        on_update: Arc<dyn Fn(CommandResponse) + Send + Sync>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("flowport-callback".into())
            .spawn(move || {
                let span = info_span!("flowport_callback");
                let _enter = span.enter();
                loop {
                    select! {
                        recv(on_read_q.data()) -> msg => match msg {
                            Ok(line) => on_read(line),
                            Err(_) => return,
                        },
                        recv(on_update_q.data()) -> msg => match msg {
                            Ok(resp) => on_update(resp),
                            Err(_) => return,
                        },
                    }
                }
            })
            .expect("spawn callback thread")
    }

    fn spawn_poll(
        interval: Duration,
        handler: Arc<dyn Handler>,
        submitter: Submitter,
        shutdown_rx: Receiver<()>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("flowport-poll".into())
            .spawn(move || {
                let span = info_span!("flowport_poll");
                let _enter = span.enter();
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => return,
                        recv(ticker) -> _ => {
                            if let Some(cmd) = handler.poll_command() {
                                if let Err(e) = submitter.queue_command("", &cmd) {
                                    warn!(error = %e, "poll command rejected, poll task exiting");
                                    return;
                                }
                            }
                        }
                    }
                }
            })
            .expect("spawn poll thread")
    }

    /// Queues `data` for the device, returning once every resulting line has
    /// been admitted to its queue (not once it has been written).
    ///
    /// `data` may contain multiple lines; each is tracked independently with
    /// `seq`/`seq_max` set accordingly. `id` is echoed back in every
    /// [`CommandResponse`] this submission produces and may be empty.
    pub fn queue_command(&self, id: &str, data: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.inner.submitter.queue_command(id, data)
    }

    /// The number of lines currently admitted but not yet written to the
    /// device (priority queue plus normal queue).
    pub fn write_queue_len(&self) -> usize {
        self.inner.priority_q.len() + self.inner.write_q.len()
    }

    /// Stops accepting new submissions, drains and closes every internal
    /// queue, and joins the background threads. The reader thread can only
    /// be joined if its underlying stream unblocks (EOF, error, or a
    /// transport-level read timeout); see module docs.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
        self.inner.write_q.close();
        self.inner.priority_q.close();
        self.inner.meta_q.close();

        let mut handles = self.inner.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}
