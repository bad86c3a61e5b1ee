#![allow(dead_code)]

use quickbeam::{EngineEvent, InodeId, MemEngine, MountFlags, Volume};

/// Build an engine with `build`, wrap it in a mounted volume, and drain the
/// setup noise from the event log so tests see only their own traffic.
pub fn mounted_volume(build: impl FnOnce(&MemEngine)) -> Volume<MemEngine> {
    let engine = MemEngine::new();
    build(&engine);
    let volume = Volume::new(engine);
    volume.mount(MountFlags::empty()).unwrap();
    volume.engine().take_events();
    volume
}

/// Highest number of simultaneously live engine opens observed for `id`
/// across the event trace. The single-open invariant means this never
/// exceeds one for any identity.
pub fn max_live_opens(events: &[EngineEvent], id: InodeId) -> u32 {
    let mut live = 0u32;
    let mut max = 0;
    for event in events {
        match event {
            EngineEvent::Open(i) | EngineEvent::InternalOpen(i) if *i == id => {
                live += 1;
                max = max.max(live);
            }
            EngineEvent::Close(i) | EngineEvent::InternalClose(i) if *i == id => {
                live = live.saturating_sub(1);
            }
            _ => {}
        }
    }
    max
}

/// Index of the first occurrence of `needle` in `events`.
pub fn position_of(events: &[EngineEvent], needle: EngineEvent) -> Option<usize> {
    events.iter().position(|event| *event == needle)
}

/// Index of the last occurrence of `needle` in `events`.
pub fn last_position_of(events: &[EngineEvent], needle: EngineEvent) -> Option<usize> {
    events.iter().rposition(|event| *event == needle)
}
