//! `parallel "script1","script2",…`
//!
//! Each fragment runs on its own OS thread, in a forked [`Interpreter`]
//! that shares the library, the command table, the console and the `__`
//! variables with its parent.  The parent's images are handed out for the
//! duration of the run and replaced by [`ImageSlot::MovedOut`] sentinels:
//!
//! * one fragment: the images are moved into the thread;
//! * several fragments: every thread gets copy-on-write handles to the same
//!   images, and when merging, the last thread that modified an image wins.
//!
//! Images a thread appends follow the merged ones, in thread order.  The
//! first failing fragment raises every sibling's abort flag; all threads
//! are joined and the error is returned.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{InterpreterError, OpError};
use crate::image::{Image, ImageList, ImageSlot, MoveTag};

use super::interp::Interpreter;

/// Stack size of interpreter threads.  Custom-command recursion runs on
/// the native stack.
pub const THREAD_STACK_SIZE: usize = 64 << 20;

static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

type Outcome = (usize, Result<ImageList, InterpreterError>);

/// Strip the double quotes around a fragment.
pub fn unquote(fragment: &str) -> String {
    let t = fragment.trim();
    if t.len() >= 2 && t.starts_with('"') && t.ends_with('"') {
        t[1..t.len() - 1].to_owned()
    } else {
        t.to_owned()
    }
}

// ── Job ───────────────────────────────────────────────────────────────────────

struct Job {
    index: usize,
    interp: Interpreter,
    script: String,
    images: ImageList,
    tx: Sender<Outcome>,
}

impl Job {
    fn run(self) {
        let Job { index, mut interp, script, mut images, tx } = self;
        tracing::info!(thread = index, "parallel thread started");
        let result = interp.run_fragment(&script, &mut images).map(|()| images);
        tracing::info!(thread = index, ok = result.is_ok(), "parallel thread finished");
        let _ = tx.send((index, result));
    }
}

fn take(slot: &Mutex<Option<Job>>) -> Option<Job> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}

// ── Pending ───────────────────────────────────────────────────────────────────

/// A running group of fragments.
pub struct Pending {
    group: u64,
    fragments: usize,
    /// Handles given to the threads, one per input image; empty when the
    /// images were moved to a single thread.
    originals: Vec<Arc<Image>>,
    names: Vec<String>,
    handles: Vec<JoinHandle<()>>,
    flags: Vec<Arc<AtomicBool>>,
    rx: Receiver<Outcome>,
}

/// Hand `images` out to one thread per fragment.
pub(super) fn spawn(
    parent: &Interpreter,
    fragments: Vec<String>,
    images: &mut ImageList,
) -> Result<Pending, InterpreterError> {
    if fragments.is_empty() {
        return Err(InterpreterError::argument("No script to run in parallel."));
    }
    if let Some(i) = images.slots.iter().position(ImageSlot::is_moved_out) {
        return Err(OpError::MovedOut(i).into());
    }
    let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
    let single = fragments.len() == 1;
    let mut lists: Vec<ImageList> = fragments.iter().map(|_| ImageList::new()).collect();
    let mut originals = Vec::new();

    for (index, slot) in images.slots.iter_mut().enumerate() {
        let taken = std::mem::replace(slot, ImageSlot::MovedOut(MoveTag { group, index }));
        if single {
            lists[0].slots.push(taken);
            continue;
        }
        let arc = match taken {
            ImageSlot::Owned(img) => Arc::new(img),
            ImageSlot::Shared(arc) => arc,
            ImageSlot::MovedOut(_) => return Err(OpError::MovedOut(index).into()),
        };
        for list in &mut lists {
            list.slots.push(ImageSlot::Shared(Arc::clone(&arc)));
        }
        originals.push(arc);
    }
    for list in &mut lists {
        list.names = images.names.clone();
    }

    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();
    let mut flags = Vec::new();
    for (index, (script, list)) in fragments.into_iter().zip(lists).enumerate() {
        let interp = parent.fork();
        flags.push(interp.abort_handle());
        let job = Arc::new(Mutex::new(Some(Job { index, interp, script, images: list, tx: tx.clone() })));
        let theirs = Arc::clone(&job);
        let spawned = thread::Builder::new()
            .name(format!("parallel-{index}"))
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || {
                if let Some(job) = take(&theirs) {
                    job.run();
                }
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::warn!(thread = index, error = %e, "cannot spawn thread, running fragment in place");
                if let Some(job) = take(&job) {
                    job.run();
                }
            }
        }
    }

    Ok(Pending {
        group,
        fragments: flags.len(),
        originals,
        names: images.names.clone(),
        handles,
        flags,
        rx,
    })
}

impl Pending {
    fn raise_abort(&self) {
        for flag in &self.flags {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Wait for every thread and merge the results into `images`.
    pub fn join(mut self, images: &mut ImageList) -> Result<(), InterpreterError> {
        let mut results: Vec<Option<ImageList>> = (0..self.fragments).map(|_| None).collect();
        let mut error: Option<InterpreterError> = None;
        for (index, outcome) in self.rx.iter() {
            match outcome {
                Ok(list) => results[index] = Some(list),
                Err(e) => {
                    if error.is_none() {
                        tracing::debug!(thread = index, error = %e.message, "parallel fragment failed, aborting siblings");
                        self.raise_abort();
                        error = Some(e);
                    }
                }
            }
        }
        let mut panicked = false;
        for handle in self.handles.drain(..) {
            panicked |= handle.join().is_err();
        }

        if let Some(e) = error {
            self.release(images);
            return Err(e);
        }
        if panicked || results.iter().any(Option::is_none) {
            self.release(images);
            return Err(InterpreterError::internal("A parallel thread terminated unexpectedly."));
        }
        let results: Vec<ImageList> = results.into_iter().flatten().collect();
        if self.originals.is_empty() {
            self.merge_moved(images, results);
        } else {
            self.merge_shared(images, results);
        }
        Ok(())
    }

    /// Stop the threads and drop their results.
    pub fn cancel(mut self, images: &mut ImageList) {
        self.raise_abort();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.release(images);
    }

    /// Give back the untouched shared images, or remove the sentinels of
    /// images that were moved out.
    fn release(&self, images: &mut ImageList) {
        let mut gone = Vec::new();
        for (pos, index) in images.sentinels(self.group) {
            match self.originals.get(index) {
                Some(arc) => images.slots[pos] = ImageSlot::Shared(Arc::clone(arc)),
                None => gone.push(pos),
            }
        }
        images.extract(&gone);
    }

    fn merge_moved(&self, images: &mut ImageList, results: Vec<ImageList>) {
        let positions: Vec<usize> = images.sentinels(self.group).into_iter().map(|(pos, _)| pos).collect();
        let (positions, _) = images.extract(&positions);
        let result = results.into_iter().next().unwrap_or_default();
        images.merge_back(&positions, result);
    }

    fn merge_shared(&self, images: &mut ImageList, results: Vec<ImageList>) {
        let inputs = self.originals.len();
        let mut winners: Vec<Option<(ImageSlot, String)>> = (0..inputs).map(|_| None).collect();
        let mut appended = ImageList::new();
        for list in results {
            for (slot, name, origin) in self.align(list) {
                match origin {
                    Some(k) => winners[k] = Some((slot, name)),
                    None => {
                        appended.slots.push(slot);
                        appended.names.push(name);
                    }
                }
            }
        }
        for (pos, index) in images.sentinels(self.group) {
            match winners.get_mut(index).and_then(Option::take) {
                Some((slot, name)) => {
                    images.slots[pos] = slot;
                    images.names[pos] = name;
                }
                None => images.slots[pos] = ImageSlot::Shared(Arc::clone(&self.originals[index])),
            }
        }
        images.append(appended);
    }

    /// Pair each changed slot of a thread's list with the input it replaces,
    /// or `None` for a new image.  Untouched handles anchor the alignment:
    /// inputs skipped between two anchors were removed by the thread, and a
    /// modified slot takes the earliest input before the next anchor that is
    /// not yet accounted for.  Moving an untouched image changes nothing.
    fn align(&self, list: ImageList) -> Vec<(ImageSlot, String, Option<usize>)> {
        let anchors: Vec<Option<usize>> = list
            .slots
            .iter()
            .map(|slot| self.originals.iter().position(|arc| slot.same_as(arc)))
            .collect();
        let mut cursor = 0;
        let mut changed = Vec::new();
        for (k, (slot, name)) in list.slots.into_iter().zip(list.names).enumerate() {
            match anchors[k] {
                Some(m) => {
                    cursor = cursor.max(m + 1);
                    if name != self.names[m] {
                        changed.push((slot, name, Some(m)));
                    }
                }
                None => {
                    let next = anchors[k + 1..]
                        .iter()
                        .flatten()
                        .copied()
                        .find(|&m| m >= cursor)
                        .unwrap_or(self.originals.len());
                    if cursor < next {
                        changed.push((slot, name, Some(cursor)));
                        cursor += 1;
                    } else {
                        changed.push((slot, name, None));
                    }
                }
            }
        }
        changed
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::image::ImageList;
    use crate::script::Interpreter;

    fn values(images: &ImageList) -> Vec<f32> {
        (0..images.len()).map(|i| images.image(i).unwrap().data()[0]).collect()
    }

    fn run(script: &str) -> (Interpreter, ImageList) {
        let mut interp = Interpreter::new();
        let mut images = ImageList::new();
        interp.run(script, &mut images).unwrap();
        (interp, images)
    }

    #[test]
    fn unquote_strips_outer_quotes() {
        assert_eq!(super::unquote(" \"add 1\" "), "add 1");
        assert_eq!(super::unquote("add"), "add");
    }

    #[test]
    fn fragments_modify_distinct_images() {
        let (_, images) = run("(0) (0) parallel \"add[0] 1\",\"add[1] 2\"");
        assert_eq!(values(&images), vec![1.0, 2.0]);
    }

    #[test]
    fn last_modifier_wins() {
        let (_, images) = run("(0) parallel \"add 1\",\"add 2\"");
        assert_eq!(values(&images), vec![2.0]);
    }

    #[test]
    fn single_fragment_moves_images() {
        let (_, images) = run("(1) parallel \"add 1 (5)\"");
        assert_eq!(values(&images), vec![2.0, 5.0]);
    }

    #[test]
    fn removal_in_one_thread_keeps_parent_images() {
        let (_, images) = run("(1) (2) parallel \"remove[0]\",\"skip 0\"");
        assert_eq!(values(&images), vec![1.0, 2.0]);
    }

    #[test]
    fn modification_after_removal_maps_to_its_input() {
        let (_, images) = run("(1) (2) (3) parallel \"add[0] 10 remove[1]\",\"skip 0\"");
        assert_eq!(values(&images), vec![11.0, 2.0, 3.0]);
    }

    #[test]
    fn reordering_untouched_images_changes_nothing() {
        let (_, images) = run("(1) (2) parallel \"reverse\",\"skip 0\"");
        assert_eq!(values(&images), vec![1.0, 2.0]);
    }

    #[test]
    fn appended_images_follow_thread_order() {
        let (_, images) = run("(0) parallel \"(1)\",\"(2)\"");
        assert_eq!(values(&images), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn failure_aborts_siblings() {
        let mut interp = Interpreter::new();
        let mut images = ImageList::new();
        images.push(crate::image::Image::scalar(3.0), "keep");
        let err = interp
            .run("parallel \"error boom\",\"repeat inf done\"", &mut images)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::User);
        assert!(err.rendered().contains("*thread"));
        assert_eq!(values(&images), vec![3.0]);
    }

    #[test]
    fn detached_group_joins_at_wait_and_scope_end() {
        let (_, images) = run("(0) parallel 0,\"add 1\" wait add 1");
        assert_eq!(values(&images), vec![2.0]);
        let (_, images) = run("(0) parallel 0,\"add 1\"");
        assert_eq!(values(&images), vec![1.0]);
    }

    #[test]
    fn variable_tiers_across_threads() {
        let (interp, _) = run("__n=0 _g=1 x=5 parallel \"__n+=1 _g=2 status $x\",\"__n+=1\"");
        assert_eq!(interp.variables().get("__n").as_deref(), Some("2"));
        assert_eq!(interp.variables().get("_g").as_deref(), Some("1"));
    }

    #[test]
    fn threads_share_the_console() {
        let (interp, _) = run("parallel \"echo a\",\"echo a\"");
        assert_eq!(interp.take_output(), vec!["a", "a"]);
    }
}
