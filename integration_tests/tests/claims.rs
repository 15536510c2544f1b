mod common;

use std::collections::HashMap;
use std::thread;

use common::{RecordingObserver, TestStore, SAVE_TIMEOUT};
use crossbeam_channel::unbounded;
use guild_core::{ClaimError, ClaimKey, ErrorKind, GuildError, GuildId, PlayerId, CLAIM_SLOTS_UPGRADE};

#[test]
fn tier_limit_is_enforced_and_occupancy_reported() -> anyhow::Result<()> {
    let store = TestStore::new()?;
    let mut service = store.start()?;
    let a_owner = PlayerId::random();
    let b_owner = PlayerId::random();
    let a = service.create_guild("Alpha", a_owner)?;
    let b = service.create_guild("Bravo", b_owner)?;

    for x in 0..10 {
        service.claim(a_owner, a, ClaimKey::new("world", x, 0))?;
    }
    let err = service
        .claim(a_owner, a, ClaimKey::new("world", 10, 0))
        .expect_err("limit reached");
    assert!(matches!(
        err,
        GuildError::Claim(ClaimError::LimitExceeded { limit: 10, .. })
    ));

    let err = service
        .claim(b_owner, b, ClaimKey::new("world", 4, 0))
        .expect_err("occupied");
    assert!(matches!(
        &err,
        GuildError::Claim(ClaimError::AlreadyClaimed { owner, .. }) if *owner == a
    ));
    assert_eq!(err.kind(), ErrorKind::Concurrency);

    service.set_upgrade(a_owner, a, CLAIM_SLOTS_UPGRADE, 1)?;
    service.claim(a_owner, a, ClaimKey::new("world", 10, 0))?;
    assert_eq!(service.claims_of(a).len(), 11);
    Ok(())
}

#[test]
fn claims_respect_rank_permissions() -> anyhow::Result<()> {
    let store = TestStore::new()?;
    let mut service = store.start()?;
    let owner = PlayerId::random();
    let recruit = PlayerId::random();
    let outsider = PlayerId::random();
    let id = service.create_guild("Keepers", owner)?;
    service.add_member(id, recruit)?;

    assert!(matches!(
        service.claim(recruit, id, ClaimKey::new("world", 0, 0)),
        Err(GuildError::PermissionDenied { .. })
    ));
    assert!(matches!(
        service.claim(outsider, id, ClaimKey::new("world", 0, 0)),
        Err(GuildError::NotMember { .. })
    ));

    service.claim(owner, id, ClaimKey::new("world", 0, 0))?;
    assert!(service.can_interact(recruit, &ClaimKey::new("world", 0, 0)));
    assert!(!service.can_interact(outsider, &ClaimKey::new("world", 0, 0)));
    assert!(service.can_interact(outsider, &ClaimKey::new("world", 9, 9)));
    Ok(())
}

#[test]
fn unclaim_frees_the_chunk_for_others() -> anyhow::Result<()> {
    let store = TestStore::new()?;
    let mut service = store.start()?;
    let observer = RecordingObserver::default();
    service.add_claim_observer(Box::new(observer.clone()));
    let a_owner = PlayerId::random();
    let b_owner = PlayerId::random();
    let a = service.create_guild("Alpha", a_owner)?;
    let b = service.create_guild("Bravo", b_owner)?;
    let key = ClaimKey::new("world", 2, 2);

    service.claim(a_owner, a, key.clone())?;
    assert!(matches!(
        service.unclaim(b_owner, b, &key),
        Err(GuildError::Claim(ClaimError::NotOwner { .. }))
    ));
    service.unclaim(a_owner, a, &key)?;
    service.claim(b_owner, b, key.clone())?;

    let changes = observer.take();
    let transitions: Vec<(Option<GuildId>, Option<GuildId>)> =
        changes.iter().map(|c| (c.previous, c.current)).collect();
    assert_eq!(
        transitions,
        vec![(None, Some(a)), (Some(a), None), (None, Some(b))]
    );
    Ok(())
}

#[test]
fn disband_releases_every_claim_at_once() -> anyhow::Result<()> {
    let store = TestStore::new()?;
    let mut service = store.start()?;
    let observer = RecordingObserver::default();
    service.add_claim_observer(Box::new(observer.clone()));
    let owner = PlayerId::random();
    let id = service.create_guild("Nomads", owner)?;
    for z in 0..4 {
        service.claim(owner, id, ClaimKey::new("world", 0, z))?;
    }
    observer.take();

    service.disband_guild(owner, id)?;
    let released = observer.take();
    assert_eq!(released.len(), 4);
    assert!(released.iter().all(|c| c.previous == Some(id) && c.current.is_none()));
    service.flush_blocking(SAVE_TIMEOUT)?;

    let rival = PlayerId::random();
    let other = service.create_guild("Settlers", rival)?;
    service.claim(rival, other, ClaimKey::new("world", 0, 2))?;
    service.shutdown(SAVE_TIMEOUT)?;

    let service = store.start()?;
    assert_eq!(service.claim_owner(&ClaimKey::new("world", 0, 2)), Some(other));
    assert_eq!(service.claim_owner(&ClaimKey::new("world", 0, 1)), None);
    Ok(())
}

#[test]
fn contested_chunks_have_exactly_one_winner() -> anyhow::Result<()> {
    let store = TestStore::new()?;
    let mut service = store.start()?;

    let mut contenders = Vec::new();
    for n in 0..8 {
        let owner = PlayerId::random();
        let id = service.create_guild(&format!("Clan{n}"), owner)?;
        contenders.push((owner, id));
    }

    // Host threads only enqueue; all claim decisions happen on this thread.
    let (tx, rx) = unbounded::<(PlayerId, GuildId, ClaimKey)>();
    let handles: Vec<_> = contenders
        .iter()
        .copied()
        .map(|(owner, id)| {
            let tx = tx.clone();
            thread::spawn(move || {
                for x in 0..5 {
                    let _ = tx.send((owner, id, ClaimKey::new("world", x, 0)));
                }
            })
        })
        .collect();
    drop(tx);
    for handle in handles {
        handle.join().expect("sender thread");
    }

    let mut winners: HashMap<ClaimKey, Vec<GuildId>> = HashMap::new();
    for (owner, id, key) in rx.iter() {
        match service.claim(owner, id, key.clone()) {
            Ok(()) => winners.entry(key).or_default().push(id),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Concurrency),
        }
    }

    assert_eq!(winners.len(), 5);
    for (key, ids) in &winners {
        assert_eq!(ids.len(), 1, "{key} has several owners");
        assert_eq!(service.claim_owner(key), Some(ids[0]));
    }
    let total: usize = contenders.iter().map(|(_, id)| service.claims_of(*id).len()).sum();
    assert_eq!(total, 5);
    Ok(())
}
