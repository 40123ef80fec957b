//! Link bookkeeping and propagation over the image graph.

use crossbeam::channel::Receiver;
use rasterkit::prelude::*;
use std::sync::Arc;

fn registry() -> Arc<Registry> {
    Registry::new(CoreConfig::default())
}

fn count(events: &Receiver<ImageEvent>, kind: &str) -> usize {
    events.try_iter().filter(|e| e.kind() == kind).count()
}

/// x -> a, x -> b, a -> c, b -> c
fn diamond(registry: &Arc<Registry>) -> [Image; 4] {
    let images = [(); 4].map(|_| Image::new(registry).unwrap());
    let [x, a, b, c] = &images;
    registry.link(x.id(), a.id());
    registry.link(x.id(), b.id());
    registry.link(a.id(), c.id());
    registry.link(b.id(), c.id());
    images
}

#[test]
fn test_invalidate_visits_diamond_once() {
    let registry = registry();
    let images = diamond(&registry);
    let events: Vec<_> = images.iter().map(Image::subscribe).collect();

    images[0].invalidate_all();
    for receiver in &events {
        assert_eq!(count(receiver, "invalidate"), 1);
    }

    // Nothing is upstream of x.
    images[3].invalidate_all();
    assert_eq!(count(&events[3], "invalidate"), 1);
    assert_eq!(count(&events[0], "invalidate"), 0);
}

#[test]
fn test_minimise_mirrors_invalidate() {
    let registry = registry();
    let images = diamond(&registry);
    let events: Vec<_> = images.iter().map(Image::subscribe).collect();

    images[3].minimise_all();
    for receiver in &events {
        assert_eq!(count(receiver, "minimise"), 1);
        assert_eq!(count(receiver, "invalidate"), 0);
    }

    let order = registry.reachable(images[3].id(), Direction::Upstream);
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], images[3].id());
}

#[test]
fn test_cycle_is_walked_once() {
    let registry = registry();
    let a = Image::new(&registry).unwrap();
    let b = Image::new(&registry).unwrap();
    registry.link(a.id(), b.id());
    registry.link(b.id(), a.id());

    let events = a.subscribe();
    a.invalidate_all();
    assert_eq!(count(&events, "invalidate"), 1);
}

#[test]
fn test_destroyed_image_leaves_no_links() {
    let registry = registry();
    let [x, a, b, c] = diamond(&registry);
    let gone = a.id();
    drop(a);

    assert!(!x.downstream().contains(&gone));
    assert!(!c.upstream().contains(&gone));
    assert_eq!(x.downstream(), vec![b.id()]);
    assert!(registry.check_links().is_empty());
    assert!(x.sanity().is_empty());
}

#[test]
fn test_concurrent_link_and_drop() {
    let registry = registry();
    let images: Vec<Image> = (0..8).map(|_| Image::new(&registry).unwrap()).collect();
    let ids: Vec<ImageId> = images.iter().map(Image::id).collect();

    crossbeam::thread::scope(|scope| {
        for worker in 0..4usize {
            let registry = &registry;
            let ids = &ids;
            scope.spawn(move |_| {
                for step in 0..500usize {
                    let up = ids[(worker + step) % ids.len()];
                    let down = ids[(worker * 3 + step * 7 + 1) % ids.len()];
                    if up == down {
                        continue;
                    }
                    if step % 3 == 0 {
                        registry.unlink(up, down);
                    } else {
                        registry.link(up, down);
                    }
                    if step % 50 == 0 {
                        assert!(registry.check_links().is_empty());
                    }
                }
            });
        }
    })
    .unwrap();

    assert!(registry.check_links().is_empty());

    let mut images = images;
    images.truncate(3);
    for id in &ids[3..] {
        assert!(registry.image(*id).is_none());
        for image in &images {
            assert!(!image.upstream().contains(id));
            assert!(!image.downstream().contains(id));
        }
    }
    assert!(registry.check_links().is_empty());
}

#[test]
fn test_write_keeps_source_alive() {
    let registry = registry();
    let source = Image::new_matrix_from_array(&registry, 2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let source_id = source.id();
    let expected = source.write_to_memory().unwrap();

    let out = Image::new(&registry).unwrap();
    source.write(&out).unwrap();
    drop(source);

    assert!(registry.image(source_id).is_some());
    assert_eq!(out.upstream(), vec![source_id]);
    assert_eq!(out.write_to_memory().unwrap(), expected);

    drop(out);
    assert!(registry.image(source_id).is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_edit_invalidates_consumers() {
    let registry = registry();
    let source = Image::new_matrix(&registry, 1, 1).unwrap();
    let out = Image::new(&registry).unwrap();
    source.write(&out).unwrap();

    let region = Region::new(&out);
    region.prepare(Rect::new(0, 0, 1, 1)).unwrap();
    let events = out.subscribe();

    source
        .with_pixels_mut(|pixels| pixels.copy_from_slice(&8.0f64.to_ne_bytes()))
        .unwrap();
    assert!(region.valid().is_none());
    assert_eq!(count(&events, "invalidate"), 1);

    region.prepare(Rect::new(0, 0, 1, 1)).unwrap();
    let value = region
        .with_pixels(|_, pixels| f64::from_ne_bytes(pixels.try_into().unwrap()))
        .unwrap();
    assert_eq!(value, 8.0);
}
