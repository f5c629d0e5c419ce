// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	collections::BTreeSet,
	sync::{Arc, mpsc},
	thread,
	time::Duration,
};

use velox_catalog::make_id;
use velox_core::Error;
use velox_engine::{StorageEngine, TranSource, TranType, Transaction};
use velox_testing::{
	changeset as cs,
	model::{ITEM_CLASS, ITEM_VALUE, plain_model},
	test_engine,
};

fn begin_rw_retrying(engine: &StorageEngine) -> Arc<Transaction> {
	loop {
		match engine.begin_transaction(TranType::ReadWrite, TranSource::Client, false) {
			Ok(tx) => return tx,
			// Pool pressure from outstanding async commits; back off.
			Err(Error::ConcurrentTranLimitExceeded) => thread::sleep(Duration::from_millis(1)),
			Err(e) => panic!("begin failed: {e}"),
		}
	}
}

/// Group commit: N concurrent single-operation transactions all publish,
/// the published versions are exactly the next N, and the persistence
/// log carries one entry per *merged* group commit.
#[test]
fn thousand_async_commits_publish_exactly_once() {
	const WRITERS: usize = 8;
	const PER_WRITER: usize = 125;
	const TOTAL: usize = WRITERS * PER_WRITER;

	let (engine, persister) = test_engine(plain_model());
	let engine = Arc::new(engine);
	let before = engine.read_version();

	let (sender, receiver) = mpsc::channel::<velox_engine::Result<u64>>();
	let mut threads = Vec::new();
	for writer in 0..WRITERS {
		let engine = engine.clone();
		let sender = sender.clone();
		threads.push(thread::spawn(move || {
			for i in 0..PER_WRITER {
				let counter = (writer * PER_WRITER + i + 1) as u64;
				let id = make_id(ITEM_CLASS, counter);
				let tx = begin_rw_retrying(&engine);
				engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, counter as i64))
					.unwrap();
				let sender = sender.clone();
				engine.commit_async(&tx, move |result| {
					sender.send(result).expect("result channel closed");
				})
				.unwrap();
			}
		}));
	}
	drop(sender);
	for t in threads {
		t.join().unwrap();
	}

	let mut versions = BTreeSet::new();
	for _ in 0..TOTAL {
		let version = receiver
			.recv_timeout(Duration::from_secs(30))
			.expect("commit result missing")
			.expect("async commit failed");
		versions.insert(version);
	}

	// Every transaction received its own version; the published set is
	// exactly the next TOTAL versions.
	let published = engine.read_version();
	assert_eq!(versions.len(), TOTAL);
	assert_eq!(*versions.iter().next().unwrap(), before + 1);
	assert_eq!(*versions.iter().last().unwrap(), published);
	assert_eq!(published, before + TOTAL as u64);

	// Every transaction was persisted exactly once, in one log entry
	// per merged group.
	assert_eq!(persister.transactions_persisted(), TOTAL);
	assert!(persister.commit_count() <= TOTAL);

	// All inserted objects are present.
	let tx = engine.begin_transaction(TranType::Read, TranSource::Client, false).unwrap();
	for counter in 1..=TOTAL as u64 {
		let reader = engine.get_object(&tx, make_id(ITEM_CLASS, counter)).unwrap().unwrap();
		assert_eq!(reader.get_long(ITEM_VALUE).unwrap(), counter as i64);
	}
	engine.commit(&tx).unwrap();
}

/// Synchronous commits from many threads still publish in strictly
/// increasing version order.
#[test]
fn parallel_sync_commits_stay_ordered() {
	const WRITERS: usize = 4;
	const PER_WRITER: usize = 50;

	let (engine, _persister) = test_engine(plain_model());
	let engine = Arc::new(engine);

	let mut threads = Vec::new();
	for writer in 0..WRITERS {
		let engine = engine.clone();
		threads.push(thread::spawn(move || {
			let mut versions = Vec::new();
			for i in 0..PER_WRITER {
				let counter = 10_000 + (writer * PER_WRITER + i) as u64;
				let id = make_id(ITEM_CLASS, counter);
				let tx = begin_rw_retrying(&engine);
				engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
				versions.push(engine.commit(&tx).unwrap());
			}
			versions
		}));
	}

	let mut all = Vec::new();
	for t in threads {
		let versions = t.join().unwrap();
		// Per-thread commits are strictly increasing.
		assert!(versions.windows(2).all(|w| w[0] < w[1]));
		all.extend(versions);
	}
	all.sort_unstable();
	all.dedup();
	assert_eq!(all.len(), WRITERS * PER_WRITER);
	assert_eq!(*all.last().unwrap(), engine.read_version());
}
