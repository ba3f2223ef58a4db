use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::chunkqueue::ChunkQueue;

/// Events delivered to a stream's callback (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    NewData,
    NewCQLimit,
    ConnectedSource,
    ConnectedDest,
    DisconnectedSource,
    DisconnectedDest,
    Destroy,
}

pub type StreamRef = Rc<RefCell<Stream>>;
pub type EventCb = Box<dyn FnMut(&StreamRef, StreamEvent)>;

/// A two-port dataflow node. `out` is this node's producer-side buffer;
/// `source` is the upstream peer whose `out` feeds this node, `dest` is the
/// downstream peer that drains this node's `out` (spec §3/§4.3).
pub struct Stream {
    pub out: ChunkQueue,
    pub source: Option<StreamRef>,
    dest: Option<Weak<RefCell<Stream>>>,
    pub event_cb: Option<EventCb>,
    attached: bool,
}

impl Stream {
    pub fn new() -> StreamRef {
        Rc::new(RefCell::new(Stream {
            out: ChunkQueue::new(),
            source: None,
            dest: None,
            event_cb: None,
            attached: true,
        }))
    }

    pub fn set_event_cb(&mut self, cb: EventCb) {
        self.event_cb = Some(cb);
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Parks the node off any worker's loop. Caller must ensure no I/O is
    /// in flight (spec §4.3: detachment requires quiescence).
    pub fn detach(&mut self) {
        self.attached = false;
    }

    pub fn attach(&mut self) {
        self.attached = true;
    }

    pub fn dest(&self) -> Option<StreamRef> {
        self.dest.as_ref().and_then(|w| w.upgrade())
    }
}

fn fire(node: &StreamRef, event: StreamEvent) {
    let cb = node.borrow_mut().event_cb.take();
    if let Some(mut cb) = cb {
        cb(node, event);
        node.borrow_mut().event_cb = Some(cb);
    }
}

/// Wires `source.out -> dest.source`, each side limited to one peer. Fires
/// `ConnectedSource`/`ConnectedDest` then a synchronous `NewData` so the
/// dest can drain whatever the source already buffered (spec §4.3: connect
/// is atomic at the event level).
pub fn connect(source: &StreamRef, dest: &StreamRef) {
    {
        let mut d = dest.borrow_mut();
        debug_assert!(d.source.is_none(), "stream already has a source");
        d.source = Some(Rc::clone(source));
    }
    source.borrow_mut().dest = Some(Rc::downgrade(dest));

    fire(source, StreamEvent::ConnectedDest);
    fire(dest, StreamEvent::ConnectedSource);
    if !source.borrow().out.is_empty() {
        notify(dest);
    }
}

pub fn disconnect(source: &StreamRef, dest: &StreamRef) {
    dest.borrow_mut().source = None;
    source.borrow_mut().dest = None;
    fire(source, StreamEvent::DisconnectedDest);
    fire(dest, StreamEvent::DisconnectedSource);
}

/// Cascades `NewData` to a node; its callback is expected to drain
/// `source.out` (or its own internal buffer) into its own `out` and then
/// call `notify` again on its own dest.
pub fn notify(node: &StreamRef) {
    fire(node, StreamEvent::NewData);
}

pub fn destroy(node: &StreamRef) {
    fire(node, StreamEvent::Destroy);
}

/// A no-op relay used as a splice point before the concrete upstream is
/// known (spec §4.3). Forwards `NewData` straight through.
pub fn new_plug() -> StreamRef {
    let plug = Stream::new();
    {
        let weak = Rc::downgrade(&plug);
        plug.borrow_mut().set_event_cb(Box::new(move |_node, event| {
            if event != StreamEvent::NewData {
                return;
            }
            let Some(this) = weak.upgrade() else { return };
            let moved = {
                let mut this_mut = this.borrow_mut();
                let Some(source) = this_mut.source.clone() else {
                    return;
                };
                let mut source_mut = source.borrow_mut();
                ChunkQueue::steal_all(&mut this_mut.out, &mut source_mut.out);
                this_mut.out.is_closed = source_mut.out.is_closed;
                !this_mut.out.is_empty() || this_mut.out.is_closed
            };
            if moved {
                let dest = this.borrow().dest();
                if let Some(dest) = dest {
                    notify(&dest);
                }
            }
        }));
    }
    plug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plug_relays_data_through() {
        let source = Stream::new();
        let plug = new_plug();
        let sink = Stream::new();

        connect(&source, &plug);
        connect(&plug, &sink);

        source.borrow_mut().out.append_string("hello".to_string());
        notify(&plug);

        assert_eq!(plug.borrow().out.length, 5);
    }

    #[test]
    fn disconnect_clears_peers() {
        let a = Stream::new();
        let b = Stream::new();
        connect(&a, &b);
        assert!(b.borrow().source.is_some());
        disconnect(&a, &b);
        assert!(b.borrow().source.is_none());
        assert!(a.borrow().dest().is_none());
    }
}
