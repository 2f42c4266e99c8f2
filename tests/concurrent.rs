//! Decisions racing on the same category or the same record

use std::sync::{Arc, Barrier};
use std::thread;

use blood_ledger::{
    Actor, BankError, BloodBank, BloodGroup, DonationOutcome, DonationStatus, Movement,
    RequestForm, RequestOutcome, RequestStatus, TimeStamp, Urgency,
};
use tempfile::{TempDir, tempdir};

fn bank() -> anyhow::Result<(TempDir, Arc<BloodBank>)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("concurrent.db"))?;
    Ok((temp_dir, Arc::new(BloodBank::new(Arc::new(db))?)))
}

fn submit(bank: &BloodBank, recipient: &str, category: BloodGroup, quantity: u32) -> String {
    bank.submit_request(
        &Actor::recipient(recipient),
        RequestForm {
            recipient: recipient.to_string(),
            category,
            quantity,
            reason: "trauma".to_string(),
            hospital: "General".to_string(),
            urgency: Urgency::Critical,
        },
    )
    .unwrap()
    .request
    .id
}

/// Runs `decide` for every id on its own thread, all released at once.
fn race<T, F>(ids: Vec<String>, decide: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&str) -> T + Send + Sync + 'static,
{
    let decide = Arc::new(decide);
    let barrier = Arc::new(Barrier::new(ids.len()));
    let handles: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let decide = Arc::clone(&decide);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                decide(&id)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect()
}

#[test]
fn two_requests_for_the_last_units() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    bank.adjust_stock(
        &Actor::admin("admin"),
        Movement::Credit,
        BloodGroup::ONeg,
        2,
        None,
        None,
    )?;
    let ids = vec![
        submit(&bank, "patient-1", BloodGroup::ONeg, 2),
        submit(&bank, "patient-2", BloodGroup::ONeg, 2),
    ];

    let shared = Arc::clone(&bank);
    let results = race(ids.clone(), move |id| {
        shared.decide_request(&Actor::admin("admin"), id, RequestOutcome::Approved, None)
    });

    let approved = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(approved, 1);
    assert!(results.iter().any(|result| matches!(
        result,
        Err(BankError::InsufficientStock {
            available: 0,
            requested: 2,
            ..
        })
    )));
    assert_eq!(bank.balance_of(BloodGroup::ONeg), 0);

    let statuses: Vec<_> = ids
        .iter()
        .map(|id| bank.get_request(id).unwrap().status())
        .collect();
    assert!(statuses.contains(&RequestStatus::Approved));
    assert!(statuses.contains(&RequestStatus::Pending));
    Ok(())
}

#[test]
fn many_approvals_against_stock_for_one() -> anyhow::Result<()> {
    const N: usize = 12;
    let (_dir, bank) = bank()?;
    bank.adjust_stock(
        &Actor::admin("admin"),
        Movement::Credit,
        BloodGroup::AbPos,
        4,
        None,
        None,
    )?;
    let ids: Vec<_> = (0..N)
        .map(|n| submit(&bank, &format!("patient-{n}"), BloodGroup::AbPos, 3))
        .collect();

    let shared = Arc::clone(&bank);
    let results = race(ids, move |id| {
        shared.decide_request(&Actor::admin("admin"), id, RequestOutcome::Approved, None)
    });

    let approved = results.iter().filter(|result| result.is_ok()).count();
    let refused = results
        .iter()
        .filter(|result| matches!(result, Err(BankError::InsufficientStock { .. })))
        .count();
    assert_eq!(approved, 1);
    assert_eq!(refused, N - 1);
    assert_eq!(bank.balance_of(BloodGroup::AbPos), 1);

    let debits = bank
        .ledger_entries()?
        .into_iter()
        .filter(|entry| entry.movement == Movement::Debit)
        .count();
    assert_eq!(debits, 1);
    bank.verify_ledger()?;
    Ok(())
}

#[test]
fn categories_do_not_block_each_other() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    let groups: Vec<String> = BloodGroup::ALL
        .iter()
        .map(|group| group.as_str().to_string())
        .collect();

    let shared = Arc::clone(&bank);
    let results = race(groups, move |label| {
        let category: BloodGroup = label.parse().unwrap();
        for _ in 0..10 {
            shared.adjust_stock(
                &Actor::admin("admin"),
                Movement::Credit,
                category,
                1,
                None,
                None,
            )?;
        }
        Ok::<_, BankError>(())
    });

    assert!(results.iter().all(Result::is_ok));
    assert!(bank.all_balances().values().all(|balance| *balance == 10));
    bank.verify_ledger()?;
    Ok(())
}

#[test]
fn cancel_and_decide_race_on_one_donation() -> anyhow::Result<()> {
    for _ in 0..8 {
        let (_dir, bank) = bank()?;
        let donor = Actor::donor("donor-1");
        let donation =
            bank.submit_donation(&donor, "donor-1", BloodGroup::BNeg, 5, TimeStamp::new())?;

        let shared = Arc::clone(&bank);
        let results = race(
            vec!["cancel".to_string(), "approve".to_string()],
            move |action| match action {
                "cancel" => shared
                    .cancel_donation(&Actor::donor("donor-1"), &donation.id)
                    .map(|donation| donation.status()),
                _ => shared
                    .decide_donation(&Actor::admin("admin"), &donation.id, DonationOutcome::Approved)
                    .map(|(donation, _)| donation.status()),
            },
        );

        let applied: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(applied.len(), 1, "{results:?}");
        assert!(
            results
                .iter()
                .any(|result| matches!(result, Err(BankError::InvalidState { .. })))
        );

        match applied[0] {
            DonationStatus::Approved => assert_eq!(bank.balance_of(BloodGroup::BNeg), 5),
            DonationStatus::Cancelled => assert_eq!(bank.balance_of(BloodGroup::BNeg), 0),
            other => panic!("unexpected status {other}"),
        }
    }
    Ok(())
}

#[test]
fn banks_sharing_a_database_race_for_the_last_units() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("shared.db"))?);
    let banks = [
        Arc::new(BloodBank::new(Arc::clone(&db))?),
        Arc::new(BloodBank::new(Arc::clone(&db))?),
    ];
    banks[0].adjust_stock(
        &Actor::admin("admin"),
        Movement::Credit,
        BloodGroup::BPos,
        2,
        None,
        None,
    )?;
    let ids: Vec<_> = (0..6)
        .map(|n| submit(&banks[n % 2], &format!("patient-{n}"), BloodGroup::BPos, 2))
        .collect();

    // even positions approve through the first bank, odd through the second
    let indexed: Vec<String> = ids
        .iter()
        .enumerate()
        .map(|(n, id)| format!("{}:{id}", n % 2))
        .collect();
    let shared = banks.clone();
    let results = race(indexed, move |tagged| {
        let (bank, id) = tagged.split_once(':').unwrap();
        let bank = &shared[bank.parse::<usize>().unwrap()];
        bank.decide_request(&Actor::admin("admin"), id, RequestOutcome::Approved, None)
    });

    let approved = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(approved, 1, "{results:?}");
    assert!(
        results
            .iter()
            .filter(|result| result.is_err())
            .all(|result| matches!(result, Err(BankError::InsufficientStock { .. })))
    );

    let fresh = BloodBank::new(db)?;
    assert_eq!(fresh.balance_of(BloodGroup::BPos), 0);
    fresh.verify_ledger()?;
    Ok(())
}

#[test]
fn concurrent_seeds_credit_the_stock_once() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    let shared = Arc::clone(&bank);
    let results = race(
        (0..4).map(|n| n.to_string()).collect(),
        move |_| shared.seed_if_empty(&Actor::system(), &[(BloodGroup::ONeg, 7), (BloodGroup::APos, 2)]),
    );

    let written: Vec<usize> = results
        .into_iter()
        .map(|result| result.map(|entries| entries.len()))
        .collect::<Result<_, _>>()?;
    assert_eq!(written.iter().sum::<usize>(), 2);
    assert_eq!(bank.balance_of(BloodGroup::ONeg), 7);
    assert_eq!(bank.ledger_entries()?.len(), 2);

    assert!(matches!(
        bank.seed_if_empty(&Actor::donor("donor-1"), &[(BloodGroup::ONeg, 1)]),
        Err(BankError::Authorization { .. })
    ));
    Ok(())
}
