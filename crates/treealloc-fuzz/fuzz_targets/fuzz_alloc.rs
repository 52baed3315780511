#![no_main]
use libfuzzer_sys::fuzz_target;
use treealloc_core::{Allocator, AllocatorConfig, MmapPageSource, RecordingPageSource};

fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }

    // First byte picks the arena size, second caps how many regions may be mapped.
    let arena_size = 4096 * (1 + usize::from(data[0] % 8));
    let mut source = RecordingPageSource::new(MmapPageSource::new());
    if data[1] & 0x80 != 0 {
        source.set_acquire_budget(Some(usize::from(data[1] & 0x0F)));
    }
    let Ok(config) = AllocatorConfig::new(4096, arena_size) else {
        return;
    };
    let mut a = Allocator::new(config, source);
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

    for chunk in data[2..].chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 4;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let tag = chunk[3];

        match op {
            0 => {
                if let Some(ptr) = a.allocate(size) {
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), tag, size) };
                    live.push((ptr.as_ptr(), size, tag));
                }
            }
            1 => {
                if !live.is_empty() {
                    let (ptr, len, tag) = live.swap_remove(usize::from(chunk[3]) % live.len());
                    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
                    assert!(bytes.iter().all(|&b| b == tag), "payload corrupted");
                    unsafe { a.free(ptr) };
                }
            }
            2 => {
                if !live.is_empty() {
                    let i = usize::from(chunk[3]) % live.len();
                    let (ptr, len, tag) = live[i];
                    match unsafe { a.reallocate(ptr, size) } {
                        Some(new_ptr) => {
                            let kept = len.min(size);
                            let bytes = unsafe { std::slice::from_raw_parts(new_ptr.as_ptr(), kept) };
                            assert!(bytes.iter().all(|&b| b == tag), "realloc lost data");
                            unsafe { std::ptr::write_bytes(new_ptr.as_ptr(), tag, size) };
                            live[i] = (new_ptr.as_ptr(), size, tag);
                        }
                        // Zero size frees; a failed grow keeps the old block.
                        None if size == 0 => {
                            live.swap_remove(i);
                        }
                        None => {}
                    }
                }
            }
            _ => {
                // Null and foreign pointers must be ignored.
                unsafe { a.free(std::ptr::null_mut()) };
                let mut local = [0u8; 32];
                unsafe { a.free(local.as_mut_ptr().wrapping_add(16)) };
            }
        }

        if let Err(violation) = a.check_invariants() {
            panic!("invariant violated: {violation}");
        }
        assert_eq!(a.stats().live_allocations, live.len());
    }

    for (ptr, _, _) in live {
        unsafe { a.free(ptr) };
    }
    assert_eq!(a.stats().large_arenas_live, 0);
});
