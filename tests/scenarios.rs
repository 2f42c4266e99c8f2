//! End to end workflows through the `BloodBank` service

use std::sync::Arc;

use anyhow::Context;
use blood_ledger::{
    Actor, BankError, BloodBank, BloodGroup, DonationOutcome, DonationStatus, Movement,
    RequestForm, RequestOutcome, RequestStatus, SubmissionNotice, TimeStamp, Urgency,
};
use tempfile::{TempDir, tempdir};

// Each test gets its own database under a temp dir; sled locks the directory.
fn bank() -> anyhow::Result<(TempDir, BloodBank)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("bank.db"))?;
    let bank = BloodBank::new(Arc::new(db))?;
    Ok((temp_dir, bank))
}

fn admin() -> Actor {
    Actor::admin("admin-1")
}

fn stock(bank: &BloodBank, category: BloodGroup, units: u32) -> anyhow::Result<()> {
    bank.adjust_stock(&admin(), Movement::Credit, category, units, None, None)
        .context("seeding stock")?;
    Ok(())
}

fn form(recipient: &str, category: BloodGroup, quantity: u32) -> RequestForm {
    RequestForm {
        recipient: recipient.to_string(),
        category,
        quantity,
        reason: "surgery".to_string(),
        hospital: "St. Mary".to_string(),
        urgency: Urgency::High,
    }
}

#[test]
fn approving_a_request_debits_stock() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    stock(&bank, BloodGroup::ONeg, 5)?;

    let recipient = Actor::recipient("patient-1");
    let submission = bank
        .submit_request(&recipient, form("patient-1", BloodGroup::ONeg, 3))
        .context("Request failed on submit: ")?;
    assert_eq!(submission.request.status(), RequestStatus::Pending);
    assert_eq!(submission.advisory.available, 5);
    assert!(submission.advisory.is_low);
    assert_eq!(submission.notice, SubmissionNotice::LowStock);

    let (request, entry) = bank
        .decide_request(&admin(), &submission.request.id, RequestOutcome::Approved, None)
        .context("Request failed on approval: ")?;
    let entry = entry.context("approval wrote no entry")?;

    assert_eq!(request.status(), RequestStatus::Approved);
    assert_eq!(entry.movement, Movement::Debit);
    assert_eq!(entry.quantity, 3);
    assert_eq!(entry.patient.as_deref(), Some("patient-1"));
    assert_eq!(bank.balance_of(BloodGroup::ONeg), 2);

    let debits: Vec<_> = bank
        .entries_for(BloodGroup::ONeg)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|entry| entry.movement == Movement::Debit)
        .collect();
    assert_eq!(debits.len(), 1);
    Ok(())
}

#[test]
fn approving_a_donation_credits_stock() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    let donor = Actor::donor("donor-1");

    let donation = bank.submit_donation(&donor, "donor-1", BloodGroup::APos, 10, TimeStamp::new())?;
    assert_eq!(donation.status(), DonationStatus::Pending);
    assert_eq!(bank.balance_of(BloodGroup::APos), 0);

    let (donation, entry) = bank.decide_donation(&admin(), &donation.id, DonationOutcome::Approved)?;
    let entry = entry.context("approval wrote no entry")?;

    assert_eq!(donation.status(), DonationStatus::Approved);
    assert_eq!(entry.movement, Movement::Credit);
    assert_eq!(entry.quantity, 10);
    assert_eq!(entry.donor.as_deref(), Some("donor-1"));
    assert_eq!(bank.balance_of(BloodGroup::APos), 10);
    assert_eq!(bank.ledger_entries()?.len(), 1);
    Ok(())
}

#[test]
fn short_stock_leaves_the_request_pending() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    stock(&bank, BloodGroup::BPos, 2)?;

    let recipient = Actor::recipient("patient-2");
    let submission = bank.submit_request(&recipient, form("patient-2", BloodGroup::BPos, 3))?;
    let before = bank.ledger_entries()?;

    let err = bank
        .decide_request(&admin(), &submission.request.id, RequestOutcome::Approved, None)
        .unwrap_err();
    assert!(matches!(
        err,
        BankError::InsufficientStock {
            available: 2,
            requested: 3,
            ..
        }
    ));
    assert_eq!(
        err.to_string(),
        "insufficient B+ stock. Available: 2, Requested: 3"
    );

    assert_eq!(
        bank.get_request(&submission.request.id)?.status(),
        RequestStatus::Pending
    );
    assert_eq!(bank.ledger_entries()?, before);
    assert_eq!(bank.balance_of(BloodGroup::BPos), 2);

    // once stock arrives the same request can be approved
    stock(&bank, BloodGroup::BPos, 1)?;
    let (request, _) =
        bank.decide_request(&admin(), &submission.request.id, RequestOutcome::Approved, None)?;
    assert_eq!(request.status(), RequestStatus::Approved);
    assert_eq!(bank.balance_of(BloodGroup::BPos), 0);
    Ok(())
}

#[test]
fn requests_for_empty_stock_are_still_recorded() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    let recipient = Actor::recipient("patient-3");

    let submission = bank.submit_request(&recipient, form("patient-3", BloodGroup::AbNeg, 1))?;
    assert_eq!(submission.request.status(), RequestStatus::Pending);
    assert!(submission.advisory.is_unavailable);
    assert_eq!(submission.notice, SubmissionNotice::Unavailable);

    let (request, entry) = bank.decide_request(
        &admin(),
        &submission.request.id,
        RequestOutcome::Unavailable,
        None,
    )?;
    assert_eq!(request.status(), RequestStatus::Unavailable);
    assert!(entry.is_none());
    Ok(())
}

#[test]
fn rejection_keeps_the_reason_and_moves_no_stock() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    stock(&bank, BloodGroup::OPos, 4)?;
    let recipient = Actor::recipient("patient-4");
    let submission = bank.submit_request(&recipient, form("patient-4", BloodGroup::OPos, 2))?;

    let err = bank
        .decide_request(
            &admin(),
            &submission.request.id,
            RequestOutcome::Fulfilled,
            Some("no".to_string()),
        )
        .unwrap_err();
    assert!(matches!(err, BankError::Validation(_)));

    let (request, entry) = bank.decide_request(
        &admin(),
        &submission.request.id,
        RequestOutcome::Rejected,
        Some("duplicate request".to_string()),
    )?;
    assert_eq!(request.status(), RequestStatus::Rejected);
    assert_eq!(request.rejection_reason.as_deref(), Some("duplicate request"));
    assert!(entry.is_none());
    assert_eq!(bank.balance_of(BloodGroup::OPos), 4);
    Ok(())
}

#[test]
fn cancelling_twice_fails_without_changing_state() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    let donor = Actor::donor("donor-2");
    let donation = bank.submit_donation(&donor, "donor-2", BloodGroup::ANeg, 1, TimeStamp::new())?;

    let cancelled = bank.cancel_donation(&donor, &donation.id)?;
    assert_eq!(cancelled.status(), DonationStatus::Cancelled);

    let err = bank.cancel_donation(&donor, &donation.id).unwrap_err();
    assert!(matches!(err, BankError::InvalidState { .. }));
    assert_eq!(bank.get_donation(&donation.id)?, cancelled);

    let recipient = Actor::recipient("patient-5");
    let request = bank
        .submit_request(&recipient, form("patient-5", BloodGroup::ANeg, 1))?
        .request;
    let cancelled = bank.cancel_request(&recipient, &request.id)?;
    let err = bank.cancel_request(&recipient, &request.id).unwrap_err();
    assert!(matches!(err, BankError::InvalidState { .. }));
    assert_eq!(bank.get_request(&request.id)?, cancelled);
    Ok(())
}

#[test]
fn only_owners_cancel_and_only_admins_decide() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    let owner = Actor::recipient("patient-6");
    let stranger = Actor::recipient("patient-7");
    let request = bank
        .submit_request(&owner, form("patient-6", BloodGroup::BNeg, 1))?
        .request;

    assert!(matches!(
        bank.cancel_request(&stranger, &request.id),
        Err(BankError::Authorization { .. })
    ));
    assert!(matches!(
        bank.decide_request(&owner, &request.id, RequestOutcome::Rejected, None),
        Err(BankError::Authorization { .. })
    ));
    assert!(matches!(
        bank.adjust_stock(&owner, Movement::Credit, BloodGroup::BNeg, 5, None, None),
        Err(BankError::Authorization { .. })
    ));
    assert!(matches!(
        bank.cancel_request(&owner, "req1missing"),
        Err(BankError::NotFound { .. })
    ));
    assert_eq!(bank.get_request(&request.id)?.status(), RequestStatus::Pending);
    Ok(())
}

#[test]
fn listings_are_newest_first_and_filtered_by_owner() -> anyhow::Result<()> {
    let (_dir, bank) = bank()?;
    let first = Actor::donor("donor-a");
    let second = Actor::donor("donor-b");

    let a1 = bank.submit_donation(&first, "donor-a", BloodGroup::OPos, 1, TimeStamp::new())?;
    let b1 = bank.submit_donation(&second, "donor-b", BloodGroup::OPos, 2, TimeStamp::new())?;
    let a2 = bank.submit_donation(&first, "donor-a", BloodGroup::ONeg, 3, TimeStamp::new())?;

    let ids: Vec<_> = bank.all_donations()?.into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![a2.id.clone(), b1.id.clone(), a1.id.clone()]);

    let mine: Vec<_> = bank.donations_by("donor-a")?.into_iter().map(|d| d.id).collect();
    assert_eq!(mine, vec![a2.id, a1.id]);

    bank.decide_donation(&admin(), &b1.id, DonationOutcome::Approved)?;
    stock(&bank, BloodGroup::OPos, 1)?;
    let entries = bank.ledger_entries()?;
    assert_eq!(entries.len(), 2);
    assert!(entries[0].id > entries[1].id);
    assert!(bank.requests_by("nobody")?.is_empty());
    Ok(())
}

#[test]
fn state_survives_reopening() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let path = temp_dir.path().join("reopen.db");
    let donation_id = {
        let bank = BloodBank::new(Arc::new(sled::open(&path)?))?;
        let donor = Actor::donor("donor-3");
        let donation =
            bank.submit_donation(&donor, "donor-3", BloodGroup::AbPos, 6, TimeStamp::new())?;
        bank.decide_donation(&admin(), &donation.id, DonationOutcome::Approved)?;
        bank.adjust_stock(&admin(), Movement::Debit, BloodGroup::AbPos, 2, None, Some("p".into()))?;
        bank.flush()?;
        donation.id
    };

    let bank = BloodBank::new(Arc::new(sled::open(&path)?))?;
    assert_eq!(bank.balance_of(BloodGroup::AbPos), 4);
    assert_eq!(
        bank.get_donation(&donation_id)?.status(),
        DonationStatus::Approved
    );
    let levels = bank.verify_ledger()?;
    assert_eq!(levels[&BloodGroup::AbPos].credited, 6);
    assert_eq!(levels[&BloodGroup::AbPos].debited, 2);
    Ok(())
}

#[test]
fn two_banks_on_one_database_share_the_stock() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("shared.db"))?);
    let first = BloodBank::new(Arc::clone(&db))?;
    stock(&first, BloodGroup::ONeg, 2)?;
    let second = BloodBank::new(Arc::clone(&db))?;

    let one = first
        .submit_request(&Actor::recipient("patient-a"), form("patient-a", BloodGroup::ONeg, 2))?
        .request;
    let two = second
        .submit_request(&Actor::recipient("patient-b"), form("patient-b", BloodGroup::ONeg, 2))?
        .request;

    first
        .decide_request(&admin(), &one.id, RequestOutcome::Approved, None)
        .context("first approval")?;
    let err = second
        .decide_request(&admin(), &two.id, RequestOutcome::Approved, None)
        .unwrap_err();
    assert!(matches!(
        err,
        BankError::InsufficientStock {
            available: 0,
            requested: 2,
            ..
        }
    ));
    assert_eq!(second.get_request(&two.id)?.status(), RequestStatus::Pending);

    assert_eq!(first.balance_of(BloodGroup::ONeg), 0);
    assert_eq!(second.balance_of(BloodGroup::ONeg), 0);
    second.verify_ledger()?;

    // a credit through one bank is visible through the other
    stock(&second, BloodGroup::ONeg, 3)?;
    assert_eq!(first.balance_of(BloodGroup::ONeg), 3);
    first.verify_ledger()?;

    let fresh = BloodBank::new(db)?;
    assert_eq!(fresh.balance_of(BloodGroup::ONeg), 3);
    fresh.verify_ledger()?;
    Ok(())
}
