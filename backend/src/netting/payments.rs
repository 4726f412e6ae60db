//! Residual payment derivation
//!
//! After cancellation every party has a net position (new limit minus old
//! limit). Parties with a negative position pay, parties with a positive
//! position receive. Payments are produced by repeatedly matching the largest
//! remaining debtor with the largest remaining creditor, ties broken by key,
//! which yields at most `payers + payees - 1` transfers.

use super::{limit_of, Limits, NettingPayment};
use crate::models::{Amount, EphemeralKey};
use std::collections::BTreeSet;

/// Payments that move every party from `old_limits` to `new_limits`
///
/// # Example
/// ```
/// use liquidity_savings_core::netting::{derive_payments, Limits};
/// use liquidity_savings_core::models::EphemeralKey;
///
/// let old: Limits = [("A", 10), ("B", 10)].iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect();
/// let new: Limits = [("A", 4), ("B", 16)].iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect();
///
/// let payments = derive_payments(&old, &new);
/// assert_eq!(payments.len(), 1);
/// assert_eq!(payments[0].from.as_str(), "A");
/// assert_eq!(payments[0].amount, 6);
/// ```
pub fn derive_payments(old_limits: &Limits, new_limits: &Limits) -> Vec<NettingPayment> {
    let keys: BTreeSet<&EphemeralKey> = old_limits.keys().chain(new_limits.keys()).collect();

    let mut debtors: Vec<(Amount, EphemeralKey)> = Vec::new();
    let mut creditors: Vec<(Amount, EphemeralKey)> = Vec::new();
    for key in keys {
        let delta = limit_of(new_limits, key) - limit_of(old_limits, key);
        if delta < 0 {
            debtors.push((-delta, key.clone()));
        } else if delta > 0 {
            creditors.push((delta, key.clone()));
        }
    }

    let mut payments = Vec::new();
    loop {
        sort_largest_first(&mut debtors);
        sort_largest_first(&mut creditors);
        let (Some(debtor), Some(creditor)) = (debtors.first_mut(), creditors.first_mut()) else {
            break;
        };

        let amount = debtor.0.min(creditor.0);
        payments.push(NettingPayment {
            from: debtor.1.clone(),
            to: creditor.1.clone(),
            amount,
        });
        debtor.0 -= amount;
        creditor.0 -= amount;

        debtors.retain(|(owed, _)| *owed > 0);
        creditors.retain(|(due, _)| *due > 0);
    }

    payments.sort();
    payments
}

fn sort_largest_first(positions: &mut [(Amount, EphemeralKey)]) {
    positions.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(entries: &[(&str, Amount)]) -> Limits {
        entries.iter().map(|(k, v)| (EphemeralKey::new(*k), *v)).collect()
    }

    #[test]
    fn test_balanced_positions_need_no_payment() {
        let l = limits(&[("A", 5), ("B", 7)]);
        assert!(derive_payments(&l, &l).is_empty());
    }

    #[test]
    fn test_zero_sum_groups_pay_within_group() {
        // D owes 4 to C exactly; B and E each owe 1 to A
        let old = limits(&[("A", 3), ("B", 4), ("C", 5), ("D", 4), ("E", 3)]);
        let new = limits(&[("A", 5), ("B", 3), ("C", 9), ("D", 0), ("E", 2)]);
        let payments = derive_payments(&old, &new);

        let summary: Vec<(&str, &str, Amount)> = payments
            .iter()
            .map(|p| (p.from.as_str(), p.to.as_str(), p.amount))
            .collect();
        assert_eq!(summary, vec![("B", "A", 1), ("D", "C", 4), ("E", "A", 1)]);
    }

    #[test]
    fn test_key_missing_from_old_limits_counts_as_zero() {
        let old = limits(&[("A", 10)]);
        let new = limits(&[("A", 7), ("B", 3)]);
        let payments = derive_payments(&old, &new);
        assert_eq!(payments, vec![NettingPayment { from: "A".into(), to: "B".into(), amount: 3 }]);
    }
}
