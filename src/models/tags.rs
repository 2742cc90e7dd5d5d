use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic label attached to a transfer.
///
/// Account-chain labels keep the node's transaction type names so a transaction
/// type maps onto its tag directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tag {
    #[serde(rename = "send")]
    Send,
    #[serde(rename = "replenishStake")]
    ReplenishStake,
    #[serde(rename = "kill")]
    Kill,
    #[serde(rename = "killDelegator")]
    KillDelegator,
    #[serde(rename = "delegate")]
    Delegate,
    #[serde(rename = "undelegate")]
    Undelegate,
    #[serde(rename = "invite")]
    Invite,
    #[serde(rename = "activation")]
    Activation,
    #[serde(rename = "submitFlip")]
    SubmitFlip,
    #[serde(rename = "burn")]
    Burn,
    #[serde(rename = "deployContract")]
    DeployContract,
    #[serde(rename = "callContract")]
    CallContract,
    #[serde(rename = "bridge_mint")]
    BridgeMint,
    #[serde(rename = "bridge_burn")]
    BridgeBurn,
    #[serde(rename = "bridge_burn_wrong")]
    BridgeBurnWrong,
    #[serde(rename = "dex")]
    Dex,
    #[serde(rename = "dex_buy")]
    DexBuy,
    #[serde(rename = "dex_sell")]
    DexSell,
    #[serde(rename = "dex_arb")]
    DexArb,
    #[serde(rename = "dex_provide_lp")]
    DexProvideLp,
    #[serde(rename = "dex_withdraw_lp")]
    DexWithdrawLp,
}

/// Tags recorded even when the transfer moves no value
pub const ALWAYS_RECORD_TAGS: [Tag; 7] = [
    Tag::Invite,
    Tag::Activation,
    Tag::SubmitFlip,
    Tag::Delegate,
    Tag::Undelegate,
    Tag::Kill,
    Tag::KillDelegator,
];

/// Tags that only feed statistics and never trigger detectors
pub const COUNTABLE_TAGS: [Tag; 3] = [Tag::SubmitFlip, Tag::Activation, Tag::Invite];

pub const DEX_LP_TAGS: [Tag; 2] = [Tag::DexProvideLp, Tag::DexWithdrawLp];

pub const DEX_TRADE_TAGS: [Tag; 3] = [Tag::DexBuy, Tag::DexSell, Tag::DexArb];

pub const KILL_TAGS: [Tag; 2] = [Tag::Kill, Tag::KillDelegator];

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Send => "send",
            Tag::ReplenishStake => "replenishStake",
            Tag::Kill => "kill",
            Tag::KillDelegator => "killDelegator",
            Tag::Delegate => "delegate",
            Tag::Undelegate => "undelegate",
            Tag::Invite => "invite",
            Tag::Activation => "activation",
            Tag::SubmitFlip => "submitFlip",
            Tag::Burn => "burn",
            Tag::DeployContract => "deployContract",
            Tag::CallContract => "callContract",
            Tag::BridgeMint => "bridge_mint",
            Tag::BridgeBurn => "bridge_burn",
            Tag::BridgeBurnWrong => "bridge_burn_wrong",
            Tag::Dex => "dex",
            Tag::DexBuy => "dex_buy",
            Tag::DexSell => "dex_sell",
            Tag::DexArb => "dex_arb",
            Tag::DexProvideLp => "dex_provide_lp",
            Tag::DexWithdrawLp => "dex_withdraw_lp",
        }
    }

    /// Tag for an account-chain transaction type name
    pub fn from_tx_type(tx_type: &str) -> Option<Tag> {
        match tx_type {
            "send" => Some(Tag::Send),
            "replenishStake" => Some(Tag::ReplenishStake),
            "kill" => Some(Tag::Kill),
            "killDelegator" => Some(Tag::KillDelegator),
            "delegate" => Some(Tag::Delegate),
            "undelegate" => Some(Tag::Undelegate),
            "invite" => Some(Tag::Invite),
            "activation" => Some(Tag::Activation),
            "submitFlip" => Some(Tag::SubmitFlip),
            "burn" => Some(Tag::Burn),
            "deployContract" => Some(Tag::DeployContract),
            "callContract" => Some(Tag::CallContract),
            _ => None,
        }
    }

    pub fn is_always_recorded(&self) -> bool {
        ALWAYS_RECORD_TAGS.contains(self)
    }

    pub fn is_countable(&self) -> bool {
        COUNTABLE_TAGS.contains(self)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
