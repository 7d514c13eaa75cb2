//! 授权 → 确认 → 扣款 → 结算 全流程测试
//!
//! 使用内存存储与模拟链客户端，不访问数据库和真实节点。

mod common;

use std::sync::Arc;

use common::*;
use ktvpay::{
    domain::authorization::{AuthorizationStatus, DeductionStatus},
    error::GatewayError,
    repository::AuthorizationRepository,
    service::CreateAuthorizationRequest,
};
use rust_decimal::Decimal;
use tokio_test::{assert_err, assert_ok};

fn bsc_request(amount: &str) -> CreateAuthorizationRequest {
    CreateAuthorizationRequest {
        amount_usdt: dec(amount),
        chain: "bep20".into(),
        table_no: "V12".into(),
        customer_name: "guest".into(),
        remark: String::new(),
    }
}

/// Test 1: 完整流程：100 USDT 授权，按 6.5 汇率扣 65 元
#[tokio::test]
async fn test_happy_path_settles_and_credits_ledger() {
    let h = harness().await;

    let ticket = assert_ok!(
        h.state
            .authorizations
            .create_authorization(bsc_request("100"))
            .await
    );
    assert_eq!(ticket.chain, "BSC");
    assert_eq!(ticket.merchant_wallet, MERCHANT_BSC);
    assert_eq!(ticket.password.len(), 8);
    assert_eq!(ticket.auth_url, format!("https://pay.test/auth/{}", ticket.auth_no));

    // allowance 为 0 时保持 pending，并登记客户钱包
    let status = h
        .state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
        .await
        .unwrap();
    assert_eq!(status.status, AuthorizationStatus::Pending);
    assert_eq!(status.allowance_usdt, Decimal::ZERO);
    let pending = h.state.authorizations.get_by_auth_no(&ticket.auth_no).await.unwrap();
    assert_eq!(pending.customer_wallet, CUSTOMER_BSC);

    h.chain.set_allowance(CUSTOMER_BSC, dec("100"));
    let status = h
        .state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
        .await
        .unwrap();
    assert_eq!(status.status, AuthorizationStatus::Active);
    assert_eq!(status.authorized_usdt, dec("100"));

    let receipt = h
        .state
        .deductions
        .request_deduction(&ticket.password, dec("65"), "beer x2", "op-1")
        .await
        .unwrap();
    assert_eq!(receipt.amount_usdt, dec("10.0000"));
    assert_eq!(receipt.remaining_usdt, dec("90"));
    assert_eq!(receipt.status, DeductionStatus::Processing);
    assert_eq!(receipt.customer_wallet, CUSTOMER_BSC);

    let deduction = h.settled_deduction(&receipt.deduct_no).await;
    assert_eq!(deduction.status, DeductionStatus::Success);
    assert!(deduction.tx_hash.as_deref().unwrap().starts_with("0x"));

    let auth = h.state.authorizations.get_by_auth_no(&ticket.auth_no).await.unwrap();
    assert_eq!(auth.used_usdt, dec("10"));
    assert_eq!(auth.remaining_usdt, dec("90"));
    assert_eq!(auth.status, AuthorizationStatus::Active);
    assert!(auth.quota_consistent());
    assert_eq!(h.merchant_balance().await, dec("10"));

    // 资金从客户钱包拉到公司钱包，由收款钱包签名
    let calls = h.chain.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].spender.as_deref(), Some(MERCHANT_BSC));
    assert_eq!(calls[0].from.as_deref(), Some(CUSTOMER_BSC));
    assert_eq!(calls[0].to, COMPANY_BSC);
    assert_eq!(calls[0].amount, dec("10"));

    let types = h.wait_for_event("DeductionSucceeded").await;
    assert_eq!(
        types,
        vec!["AuthorizationCreated", "AuthorizationActivated", "DeductionSucceeded"]
    );
}

/// Test 2: 扣完全部额度后授权变为 Depleted，后续扣款被拒
#[tokio::test]
async fn test_full_deduction_depletes_authorization() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("100").await;

    let receipt = h
        .state
        .deductions
        .request_deduction(&password, dec("650"), "private room", "op-1")
        .await
        .unwrap();
    assert_eq!(receipt.remaining_usdt, Decimal::ZERO);
    assert_eq!(
        h.settled_deduction(&receipt.deduct_no).await.status,
        DeductionStatus::Success
    );

    let auth = h.state.authorizations.get_by_auth_no(&auth_no).await.unwrap();
    assert_eq!(auth.status, AuthorizationStatus::Depleted);
    assert_eq!(auth.used_usdt, dec("100"));

    let err = h
        .state
        .deductions
        .request_deduction(&password, dec("6.5"), "one more", "op-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::InvalidCredential
            | GatewayError::InvalidState(_)
            | GatewayError::InsufficientQuota { .. }
    ));

    h.wait_for_event("AuthorizationClosed").await;
    let events = h.events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        ktvpay::infrastructure::event_bus::GatewayEvent::DeductionSucceeded { depleted: true, .. }
    )));
}

/// Test 3: 超额扣款同步拒绝，不写扣款记录
#[tokio::test]
async fn test_deduction_over_quota_is_rejected() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("10").await;

    let err = assert_err!(
        h.state
            .deductions
            .request_deduction(&password, dec("100"), "too much", "op-1")
            .await
    );
    match err {
        GatewayError::InsufficientQuota {
            remaining,
            requested,
        } => {
            assert_eq!(remaining, dec("10"));
            assert_eq!(requested, dec("15.3846"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let deductions = h.state.authorizations.list_deductions(&auth_no).await.unwrap();
    assert!(deductions.is_empty());
}

/// Test 4: 并发扣款总额超过剩余额度时，只接受不超过额度的子集
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deductions_never_overspend() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("50").await;
    h.chain.set_delay(100);

    let mut handles = Vec::new();
    for i in 0..12 {
        let deductions = Arc::clone(&h.state.deductions);
        let password = password.clone();
        handles.push(tokio::spawn(async move {
            deductions
                .request_deduction(&password, dec("65"), &format!("round {}", i), "op-2")
                .await
        }));
    }

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => accepted.push(receipt),
            Err(GatewayError::InsufficientQuota { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(accepted.len(), 5);
    assert_eq!(rejected, 7);

    let mut remainders: Vec<Decimal> = accepted.iter().map(|r| r.remaining_usdt).collect();
    remainders.sort();
    assert_eq!(
        remainders,
        vec![dec("0"), dec("10"), dec("20"), dec("30"), dec("40")]
    );

    for receipt in &accepted {
        assert_eq!(
            h.settled_deduction(&receipt.deduct_no).await.status,
            DeductionStatus::Success
        );
    }
    let auth = h.state.authorizations.get_by_auth_no(&auth_no).await.unwrap();
    assert!(auth.quota_consistent());
    assert_eq!(auth.remaining_usdt, Decimal::ZERO);
    assert_eq!(auth.status, AuthorizationStatus::Depleted);
    assert_eq!(h.merchant_balance().await, dec("50"));
    assert_eq!(h.state.deductions.admission_shards(), 0);
}

/// Test 5: 链上失败时扣款记为 Failed 并退回预占额度
#[tokio::test]
async fn test_failed_settlement_restores_quota() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("100").await;
    h.chain.fail_transfers(true);

    let receipt = h
        .state
        .deductions
        .request_deduction(&password, dec("130"), "failed round", "op-1")
        .await
        .unwrap();
    assert_eq!(receipt.remaining_usdt, dec("80"));

    let deduction = h.settled_deduction(&receipt.deduct_no).await;
    assert_eq!(deduction.status, DeductionStatus::Failed);
    assert!(deduction
        .fail_reason
        .as_deref()
        .unwrap()
        .contains("insufficient allowance"));

    let auth = h.state.authorizations.get_by_auth_no(&auth_no).await.unwrap();
    assert_eq!(auth.remaining_usdt, dec("100"));
    assert_eq!(auth.used_usdt, Decimal::ZERO);
    assert_eq!(auth.status, AuthorizationStatus::Active);
    assert_eq!(h.merchant_balance().await, Decimal::ZERO);
    h.wait_for_event("DeductionFailed").await;

    // 恢复后额度可再次使用
    h.chain.fail_transfers(false);
    let receipt = h
        .state
        .deductions
        .request_deduction(&password, dec("650"), "retry", "op-1")
        .await
        .unwrap();
    assert_eq!(receipt.remaining_usdt, Decimal::ZERO);
    assert_eq!(
        h.settled_deduction(&receipt.deduct_no).await.status,
        DeductionStatus::Success
    );
}

/// Test 6: 状态机：非 Pending 授权不能再确认，未生效授权不能扣款
#[tokio::test]
async fn test_state_machine_guards() {
    let h = harness().await;

    let ticket = h
        .state
        .authorizations
        .create_authorization(bsc_request("20"))
        .await
        .unwrap();

    // Pending 授权不能扣款
    let err = h
        .state
        .deductions
        .request_deduction(&ticket.password, dec("6.5"), "early", "op-1")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidCredential));

    h.state
        .authorizations
        .confirm_manual(&ticket.auth_no, CUSTOMER_BSC, "0xabc")
        .await
        .unwrap();
    let auth = h.state.authorizations.get_by_auth_no(&ticket.auth_no).await.unwrap();
    assert_eq!(auth.status, AuthorizationStatus::Active);
    assert_eq!(auth.tx_hash.as_deref(), Some("0xabc"));
    assert!(auth.authorize_time.is_some());

    let err = h
        .state
        .authorizations
        .confirm_manual(&ticket.auth_no, CUSTOMER_BSC, "0xdef")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidState(_)));

    // Active 时自动确认幂等返回
    let status = h
        .state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
        .await
        .unwrap();
    assert_eq!(status.status, AuthorizationStatus::Active);

    h.state.authorizations.revoke(&ticket.auth_no).await.unwrap();
    let err = h
        .state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidState(_)));
    assert!(matches!(
        h.state.authorizations.revoke(&ticket.auth_no).await,
        Err(GatewayError::InvalidState(_))
    ));
    assert!(matches!(
        h.state.authorizations.get_by_password(&ticket.password).await,
        Err(GatewayError::InvalidCredential)
    ));
}

/// Test 7: 过期授权即使 allowance 充足也拒绝自动确认
#[tokio::test]
async fn test_expired_authorization_rejected_by_confirm_auto() {
    let h = harness().await;
    let ticket = h
        .state
        .authorizations
        .create_authorization(bsc_request("30"))
        .await
        .unwrap();
    h.chain.set_allowance(CUSTOMER_BSC, dec("1000"));
    h.store
        .set_expire_time(&ticket.auth_no, chrono::Utc::now().timestamp() - 5)
        .await
        .unwrap();

    let err = h
        .state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Expired(_)));

    let auth = h.state.authorizations.get_by_auth_no(&ticket.auth_no).await.unwrap();
    assert_eq!(auth.status, AuthorizationStatus::Expired);
}

/// Test 8: 扣款时已过期的授权返回 Expired 并落库
#[tokio::test]
async fn test_expired_authorization_rejects_deduction() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("30").await;
    h.store
        .set_expire_time(&auth_no, chrono::Utc::now().timestamp() - 1)
        .await
        .unwrap();

    let err = h
        .state
        .deductions
        .request_deduction(&password, dec("6.5"), "late", "op-1")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Expired(_)));
    let auth = h.state.authorizations.get_by_auth_no(&auth_no).await.unwrap();
    assert_eq!(auth.status, AuthorizationStatus::Expired);
}

/// Test 9: 无可签名收款钱包时拒绝创建
#[tokio::test]
async fn test_no_wallet_with_signing_key() {
    let h = harness().await;
    h.store.add_payout_wallet("ETH", KEYLESS_BSC).await;

    let err = h
        .state
        .authorizations
        .create_authorization(CreateAuthorizationRequest {
            amount_usdt: dec("10"),
            chain: "erc20".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NoWalletAvailable(ref c) if c == "ETH"));

    let err = h
        .state
        .authorizations
        .create_authorization(CreateAuthorizationRequest {
            amount_usdt: dec("10"),
            chain: "DOGE".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnsupportedChain(_)));

    let err = h
        .state
        .authorizations
        .create_authorization(bsc_request("0"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidInput(_)));
}

/// Test 10: 空链名默认 TRON，公司 TRON 钱包未配置时资金直接进收款钱包
#[tokio::test]
async fn test_tron_default_chain_settles_to_merchant_wallet() {
    let h = harness().await;
    let ticket = h
        .state
        .authorizations
        .create_authorization(CreateAuthorizationRequest {
            amount_usdt: dec("40"),
            chain: String::new(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ticket.chain, "TRON");
    assert_eq!(ticket.merchant_wallet, MERCHANT_TRON);

    // EVM 地址不能用于 TRON 授权
    let err = h
        .state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidAddress(_)));

    h.chain.set_allowance(CUSTOMER_TRON, dec("40"));
    h.state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_TRON)
        .await
        .unwrap();

    let receipt = h
        .state
        .deductions
        .request_deduction(&ticket.password, dec("13"), "fruit", "op-3")
        .await
        .unwrap();
    assert_eq!(receipt.amount_usdt, dec("2"));
    assert_eq!(
        h.settled_deduction(&receipt.deduct_no).await.status,
        DeductionStatus::Success
    );

    let calls = h.chain.calls();
    assert_eq!(calls[0].chain, "TRON");
    assert_eq!(calls[0].to, MERCHANT_TRON);
    assert_eq!(calls[0].from.as_deref(), Some(CUSTOMER_TRON));
}

/// Test 11: 查询接口：按密码查询、扣款历史、有效授权列表
#[tokio::test]
async fn test_queries() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("100").await;

    for fiat in ["6.5", "13"] {
        let receipt = h
            .state
            .deductions
            .request_deduction(&password, dec(fiat), "snack", "op-1")
            .await
            .unwrap();
        h.settled_deduction(&receipt.deduct_no).await;
    }

    let auth = h.state.authorizations.get_by_password(&password).await.unwrap();
    assert_eq!(auth.auth_no, auth_no);
    assert_eq!(auth.remaining_usdt, dec("97"));

    let history = h.state.authorizations.deduction_history(&password).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|d| d.status == DeductionStatus::Success));
    assert_eq!(
        h.state.authorizations.list_deductions(&auth_no).await.unwrap().len(),
        2
    );

    let active = h.state.authorizations.get_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert!(h.state.authorizations.list_pending().await.unwrap().is_empty());

    assert!(matches!(
        h.state.authorizations.get_by_password("NOPE1234").await,
        Err(GatewayError::InvalidCredential)
    ));
    assert!(matches!(
        h.state.authorizations.get_by_auth_no("A000").await,
        Err(GatewayError::NotFound(_))
    ));
}

/// Test 12: 激活时访问密码按客户钱包加密保存，可校验
#[tokio::test]
async fn test_password_sealed_on_activation() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("10").await;

    let auth = h.store.find_by_auth_no(&auth_no).await.unwrap().unwrap();
    let sealed = auth.sealed_password.clone().expect("password should be sealed");
    assert_eq!(sealed.salt.len(), 16);
    assert_eq!(sealed.nonce.len(), 12);
    assert_ne!(sealed.ciphertext, password.as_bytes());

    assert!(h.state.authorizations.verify_password(&auth, &password).await.unwrap());
    assert!(!h.state.authorizations.verify_password(&auth, "WRONG123").await.unwrap());

    // 已全部加密，补写任务无事可做
    assert_eq!(
        h.state.authorizations.seal_password_backlog(50).await.unwrap(),
        0
    );
}

/// Test 13: 未配置主密钥时不加密，按明文常量时间比较
#[tokio::test]
async fn test_without_master_key_passwords_stay_plain() {
    let mut config = test_config();
    config.gateway.auth_master_key = None;
    let h = harness_with(config).await;
    let (auth_no, password) = h.active_authorization("10").await;

    let auth = h.store.find_by_auth_no(&auth_no).await.unwrap().unwrap();
    assert!(auth.sealed_password.is_none());
    assert!(h.state.authorizations.verify_password(&auth, &password).await.unwrap());
    assert!(matches!(
        h.state.authorizations.seal_password_backlog(10).await,
        Err(GatewayError::InvalidInput(_))
    ));
}

/// Test 14: 链查询失败时自动确认返回错误，授权保持 Pending
#[tokio::test]
async fn test_allowance_query_failure_keeps_pending() {
    let h = harness().await;
    let ticket = h
        .state
        .authorizations
        .create_authorization(bsc_request("10"))
        .await
        .unwrap();
    h.chain.fail_allowance(true);

    let err = h
        .state
        .authorizations
        .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ChainQueryFailed(_)));
    let auth = h.state.authorizations.get_by_auth_no(&ticket.auth_no).await.unwrap();
    assert_eq!(auth.status, AuthorizationStatus::Pending);
}

/// Test 15: 最后一笔在途扣款失败、剩余只剩零头时授权同样耗尽
#[tokio::test]
async fn test_failed_dust_deduction_still_depletes() {
    let h = harness().await;
    let (auth_no, password) = h.active_authorization("10").await;
    h.chain.set_delay(50);
    h.chain.fail_amount(dec("0.005"));

    let big = h
        .state
        .deductions
        .request_deduction(&password, dec("64.9675"), "main course", "op-1")
        .await
        .unwrap();
    assert_eq!(big.amount_usdt, dec("9.995"));
    let dust = h
        .state
        .deductions
        .request_deduction(&password, dec("0.0325"), "tip", "op-1")
        .await
        .unwrap();
    assert_eq!(dust.amount_usdt, dec("0.005"));
    assert_eq!(dust.remaining_usdt, Decimal::ZERO);

    assert_eq!(
        h.settled_deduction(&big.deduct_no).await.status,
        DeductionStatus::Success
    );
    assert_eq!(
        h.settled_deduction(&dust.deduct_no).await.status,
        DeductionStatus::Failed
    );

    let auth = h.state.authorizations.get_by_auth_no(&auth_no).await.unwrap();
    assert_eq!(auth.remaining_usdt, dec("0.005"));
    assert_eq!(auth.status, AuthorizationStatus::Depleted);
    assert!(auth.quota_consistent());
    h.wait_for_event("AuthorizationClosed").await;
}

/// Test 16: 查询 allowance 期间授权被撤销，自动确认报告真实状态
#[tokio::test]
async fn test_confirm_auto_loses_race_to_revoke() {
    let h = harness().await;
    let ticket = h
        .state
        .authorizations
        .create_authorization(bsc_request("10"))
        .await
        .unwrap();
    h.chain.set_allowance(CUSTOMER_BSC, dec("10"));
    h.chain.set_delay(200);

    let authorizations = Arc::clone(&h.state.authorizations);
    let auth_no = ticket.auth_no.clone();
    let confirm = tokio::spawn(async move {
        authorizations.confirm_auto(&auth_no, CUSTOMER_BSC).await
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.state.authorizations.revoke(&ticket.auth_no).await.unwrap();

    let err = confirm.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::InvalidState(ref msg) if msg.contains("revoked")));
    let auth = h.state.authorizations.get_by_auth_no(&ticket.auth_no).await.unwrap();
    assert_eq!(auth.status, AuthorizationStatus::Revoked);
    assert!(!h.event_types().await.contains(&"AuthorizationActivated"));
}

/// Test 17: 并发自动确认只激活一次，落后的一方幂等返回 Active
#[tokio::test]
async fn test_concurrent_confirm_auto_is_idempotent() {
    let h = harness().await;
    let ticket = h
        .state
        .authorizations
        .create_authorization(bsc_request("10"))
        .await
        .unwrap();
    h.chain.set_allowance(CUSTOMER_BSC, dec("10"));
    h.chain.set_delay(50);

    let first = h.state.authorizations.confirm_auto(&ticket.auth_no, CUSTOMER_BSC);
    let second = h.state.authorizations.confirm_auto(&ticket.auth_no, CUSTOMER_BSC);
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().status, AuthorizationStatus::Active);
    assert_eq!(second.unwrap().status, AuthorizationStatus::Active);

    let activations = h
        .event_types()
        .await
        .into_iter()
        .filter(|t| *t == "AuthorizationActivated")
        .count();
    assert_eq!(activations, 1);
}

/// Test 18: 扣款编号冲突时重新生成编号并重试，额度只预占一次
#[tokio::test]
async fn test_deduction_number_collision_is_retried() {
    let colliding = Arc::new(std::sync::Mutex::new(None));
    let slot = Arc::clone(&colliding);
    let h = harness_wrapping(test_config(), move |store| {
        let repo = Arc::new(CollidingDeductionNumbers::new(store, 1));
        *slot.lock().unwrap() = Some(Arc::clone(&repo));
        repo as Arc<dyn AuthorizationRepository>
    })
    .await;
    let repo = colliding.lock().unwrap().clone().unwrap();
    let (auth_no, password) = h.active_authorization("100").await;

    let receipt = assert_ok!(
        h.state
            .deductions
            .request_deduction(&password, dec("65"), "beer x2", "op-1")
            .await
    );
    assert_eq!(receipt.remaining_usdt, dec("90"));
    assert_eq!(repo.attempts(), 2);
    let numbers = repo.deduct_nos();
    assert_ne!(numbers[0], numbers[1]);
    assert_eq!(receipt.deduct_no, numbers[1]);

    assert_eq!(
        h.settled_deduction(&receipt.deduct_no).await.status,
        DeductionStatus::Success
    );
    let auth = h.state.authorizations.get_by_auth_no(&auth_no).await.unwrap();
    assert_eq!(auth.remaining_usdt, dec("90"));
    assert_eq!(h.store.list_deductions_by_auth(auth.id).await.unwrap().len(), 1);
}

/// Test 19: 连续冲突超过重试次数时放弃，额度不变
#[tokio::test]
async fn test_persistent_deduction_number_collision_gives_up() {
    let colliding = Arc::new(std::sync::Mutex::new(None));
    let slot = Arc::clone(&colliding);
    let h = harness_wrapping(test_config(), move |store| {
        let repo = Arc::new(CollidingDeductionNumbers::new(store, usize::MAX));
        *slot.lock().unwrap() = Some(Arc::clone(&repo));
        repo as Arc<dyn AuthorizationRepository>
    })
    .await;
    let repo = colliding.lock().unwrap().clone().unwrap();
    let (auth_no, password) = h.active_authorization("100").await;

    let err = assert_err!(
        h.state
            .deductions
            .request_deduction(&password, dec("65"), "beer x2", "op-1")
            .await
    );
    assert!(err.is_duplicate());
    assert_eq!(repo.attempts(), 3);

    let auth = h.state.authorizations.get_by_auth_no(&auth_no).await.unwrap();
    assert_eq!(auth.remaining_usdt, dec("100"));
    assert!(h.store.list_deductions_by_auth(auth.id).await.unwrap().is_empty());
}
