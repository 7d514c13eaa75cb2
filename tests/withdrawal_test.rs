//! 商户提现：申请 → 审核 → 公司钱包出款

mod common;

use common::*;
use ktvpay::{domain::settlement::WithdrawalStatus, error::GatewayError, repository::LedgerRepository};
use rust_decimal::Decimal;
use tokio_test::assert_ok;

const PAYEE: &str = "0x9999999999999999999999999999999999999999";

async fn funded_merchant(h: &Harness, balance: &str) -> i64 {
    h.store
        .add_merchant("payee-merchant", PAYEE, dec(balance))
        .await
}

async fn balance_of(h: &Harness, merchant_id: i64) -> Decimal {
    h.store
        .find_merchant(merchant_id)
        .await
        .unwrap()
        .unwrap()
        .balance
}

/// Test 1: 审核通过后扣减余额，公司钱包出款完成
#[tokio::test]
async fn test_approved_withdrawal_is_paid_out() {
    let h = harness().await;
    let merchant_id = funded_merchant(&h, "100").await;

    let withdrawal = assert_ok!(
        h.state
            .withdrawals
            .request_withdrawal(merchant_id, dec("40"), PAYEE, None)
            .await
    );
    assert_eq!(withdrawal.status, WithdrawalStatus::Pending);
    assert_eq!(withdrawal.chain, "BSC");
    // 申请阶段不扣余额
    assert_eq!(balance_of(&h, merchant_id).await, dec("100"));

    let approved = h
        .state
        .withdrawals
        .approve(&withdrawal.withdraw_no, "auditor")
        .await
        .unwrap();
    assert_eq!(approved.status, WithdrawalStatus::Approved);
    assert_eq!(approved.reviewed_by.as_deref(), Some("auditor"));
    assert_eq!(balance_of(&h, merchant_id).await, dec("60"));

    let done = h.finished_withdrawal(&withdrawal.withdraw_no).await;
    assert_eq!(done.status, WithdrawalStatus::Completed);
    assert!(done.tx_hash.is_some());
    assert_eq!(balance_of(&h, merchant_id).await, dec("60"));

    let calls = h.chain.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].to, PAYEE);
    assert_eq!(calls[0].amount, dec("40"));
    assert!(calls[0].from.is_none());
    h.wait_for_event("WithdrawalCompleted").await;

    // 终态不能再审核
    assert!(matches!(
        h.state.withdrawals.approve(&withdrawal.withdraw_no, "auditor").await,
        Err(GatewayError::InvalidState(_))
    ));
}

/// Test 2: 出款失败时标记 Rejected 并退回余额
#[tokio::test]
async fn test_failed_payout_recredits_balance() {
    let h = harness().await;
    let merchant_id = funded_merchant(&h, "50").await;
    h.chain.fail_transfers(true);

    let withdrawal = h
        .state
        .withdrawals
        .request_withdrawal(merchant_id, dec("50"), PAYEE, Some("bep20"))
        .await
        .unwrap();
    h.state
        .withdrawals
        .approve(&withdrawal.withdraw_no, "auditor")
        .await
        .unwrap();

    let done = h.finished_withdrawal(&withdrawal.withdraw_no).await;
    assert_eq!(done.status, WithdrawalStatus::Rejected);
    assert!(done
        .reject_reason
        .as_deref()
        .unwrap()
        .starts_with("transfer failed"));
    assert_eq!(balance_of(&h, merchant_id).await, dec("50"));
    h.wait_for_event("WithdrawalRejected").await;
}

/// Test 3: 公司私钥缺失时出款失败并退回
#[tokio::test]
async fn test_missing_company_key_rejects_payout() {
    let mut config = test_config();
    config.gateway.company_private_key = None;
    let h = harness_with(config).await;
    let merchant_id = funded_merchant(&h, "20").await;

    let withdrawal = h
        .state
        .withdrawals
        .request_withdrawal(merchant_id, dec("20"), PAYEE, None)
        .await
        .unwrap();
    h.state
        .withdrawals
        .approve(&withdrawal.withdraw_no, "auditor")
        .await
        .unwrap();

    let done = h.finished_withdrawal(&withdrawal.withdraw_no).await;
    assert_eq!(done.status, WithdrawalStatus::Rejected);
    assert!(done.reject_reason.as_deref().unwrap().contains("company wallet"));
    assert_eq!(balance_of(&h, merchant_id).await, dec("20"));
    assert!(h.chain.calls().is_empty());
}

/// Test 4: 拒绝待审核提现，余额不变
#[tokio::test]
async fn test_reject_pending_withdrawal() {
    let h = harness().await;
    let merchant_id = funded_merchant(&h, "30").await;

    let withdrawal = h
        .state
        .withdrawals
        .request_withdrawal(merchant_id, dec("10"), PAYEE, None)
        .await
        .unwrap();
    h.state
        .withdrawals
        .reject(&withdrawal.withdraw_no, "auditor", "wrong address")
        .await
        .unwrap();

    let rejected = h.state.withdrawals.get_withdrawal(&withdrawal.withdraw_no).await.unwrap();
    assert_eq!(rejected.status, WithdrawalStatus::Rejected);
    assert_eq!(rejected.reject_reason.as_deref(), Some("wrong address"));
    assert_eq!(balance_of(&h, merchant_id).await, dec("30"));

    assert!(matches!(
        h.state
            .withdrawals
            .reject(&withdrawal.withdraw_no, "auditor", "again")
            .await,
        Err(GatewayError::InvalidState(_))
    ));
}

/// Test 5: 参数与余额校验
#[tokio::test]
async fn test_request_validation() {
    let h = harness().await;
    let merchant_id = funded_merchant(&h, "5").await;
    let withdrawals = &h.state.withdrawals;

    assert!(matches!(
        withdrawals.request_withdrawal(merchant_id, dec("6"), PAYEE, None).await,
        Err(GatewayError::InsufficientBalance)
    ));
    assert!(matches!(
        withdrawals.request_withdrawal(merchant_id, Decimal::ZERO, PAYEE, None).await,
        Err(GatewayError::InvalidInput(_))
    ));
    assert!(matches!(
        withdrawals.request_withdrawal(merchant_id, dec("1"), "  ", None).await,
        Err(GatewayError::InvalidInput(_))
    ));
    assert!(matches!(
        withdrawals
            .request_withdrawal(merchant_id, dec("1"), MERCHANT_TRON, None)
            .await,
        Err(GatewayError::InvalidAddress(_))
    ));
    assert!(matches!(
        withdrawals.request_withdrawal(9999, dec("1"), PAYEE, None).await,
        Err(GatewayError::NotFound(_))
    ));
}

/// Test 6: 两笔待审核提现合计超过余额时，第二笔审核被拒
#[tokio::test]
async fn test_approve_rechecks_balance() {
    let h = harness().await;
    let merchant_id = funded_merchant(&h, "10").await;

    let first = h
        .state
        .withdrawals
        .request_withdrawal(merchant_id, dec("8"), PAYEE, None)
        .await
        .unwrap();
    let second = h
        .state
        .withdrawals
        .request_withdrawal(merchant_id, dec("8"), PAYEE, None)
        .await
        .unwrap();

    h.state.withdrawals.approve(&first.withdraw_no, "auditor").await.unwrap();
    assert!(matches!(
        h.state.withdrawals.approve(&second.withdraw_no, "auditor").await,
        Err(GatewayError::InsufficientBalance)
    ));
    assert_eq!(
        h.state
            .withdrawals
            .get_withdrawal(&second.withdraw_no)
            .await
            .unwrap()
            .status,
        WithdrawalStatus::Pending
    );
}

/// Test 7: 分页查询
#[tokio::test]
async fn test_list_withdrawals_paginates() {
    let h = harness().await;
    let merchant_id = funded_merchant(&h, "100").await;
    for _ in 0..5 {
        h.state
            .withdrawals
            .request_withdrawal(merchant_id, dec("1"), PAYEE, None)
            .await
            .unwrap();
    }

    let page = h.state.withdrawals.list_withdrawals(merchant_id, 1, 2).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items.len(), 2);

    let last = h.state.withdrawals.list_withdrawals(merchant_id, 3, 2).await.unwrap();
    assert_eq!(last.items.len(), 1);

    let clamped = h.state.withdrawals.list_withdrawals(merchant_id, 0, 1000).await.unwrap();
    assert_eq!(clamped.page, 1);
    assert_eq!(clamped.page_size, 100);
    assert_eq!(clamped.items.len(), 5);

    let other = h.merchant_id().await;
    assert_eq!(
        h.state.withdrawals.list_withdrawals(other, 1, 10).await.unwrap().total,
        0
    );
}

/// Test 8: 超大页码不溢出，返回空页
#[tokio::test]
async fn test_list_withdrawals_huge_page() {
    let h = harness().await;
    let merchant_id = funded_merchant(&h, "10").await;
    h.state
        .withdrawals
        .request_withdrawal(merchant_id, dec("1"), PAYEE, None)
        .await
        .unwrap();

    let page = h
        .state
        .withdrawals
        .list_withdrawals(merchant_id, i64::MAX, 10)
        .await
        .unwrap();
    assert_eq!(page.page, i64::MAX);
    assert_eq!(page.total, 1);
    assert!(page.items.is_empty());
}

/// Test 9: 扣款入账的余额可以提现
#[tokio::test]
async fn test_settled_deductions_fund_withdrawals() {
    let h = harness().await;
    let (_, password) = h.active_authorization("100").await;
    let receipt = h
        .state
        .deductions
        .request_deduction(&password, dec("162.5"), "set menu", "op-9")
        .await
        .unwrap();
    h.settled_deduction(&receipt.deduct_no).await;

    let merchant_id = h.merchant_id().await;
    assert_eq!(balance_of(&h, merchant_id).await, dec("25"));

    let withdrawal = h
        .state
        .withdrawals
        .request_withdrawal(merchant_id, dec("25"), PAYEE, None)
        .await
        .unwrap();
    h.state
        .withdrawals
        .approve(&withdrawal.withdraw_no, "auditor")
        .await
        .unwrap();
    assert_eq!(
        h.finished_withdrawal(&withdrawal.withdraw_no).await.status,
        WithdrawalStatus::Completed
    );
    assert_eq!(balance_of(&h, merchant_id).await, Decimal::ZERO);
}
