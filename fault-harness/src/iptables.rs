//! `iptables` command builder for link failures between cluster members.
//!
//! Builds `iptables` rules that drop traffic to and from a single peer.
//! Every rule carries a `faultline` comment so the harness only ever touches
//! rules it installed. Requires `iptables` on the node and `NET_ADMIN`
//! (containers) or `sudo` (VMs).

/// Comment attached to every rule the harness installs.
pub const RULE_COMMENT: &str = "faultline";

/// Traffic direction a rule blocks, relative to the node it is installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packets arriving from the peer (`INPUT -s peer`).
    FromPeer,
    /// Packets sent to the peer (`OUTPUT -d peer`).
    ToPeer,
}

/// A single DROP rule against one peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesRule {
    /// Peer address (IP or resolvable hostname).
    pub peer: String,
    /// Direction blocked.
    pub direction: Direction,
    /// Prefix commands with `sudo`.
    pub sudo: bool,
}

impl IptablesRule {
    /// Drop packets arriving from `peer`.
    pub fn drop_from(peer: &str) -> Self {
        Self {
            peer: peer.into(),
            direction: Direction::FromPeer,
            sudo: false,
        }
    }

    /// Drop packets sent to `peer`.
    pub fn drop_to(peer: &str) -> Self {
        Self {
            peer: peer.into(),
            direction: Direction::ToPeer,
            sudo: false,
        }
    }

    /// Run through `sudo`.
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    fn rule_spec(&self) -> Vec<String> {
        let (chain, flag) = match self.direction {
            Direction::FromPeer => ("INPUT", "-s"),
            Direction::ToPeer => ("OUTPUT", "-d"),
        };
        vec![
            chain.into(),
            flag.into(),
            self.peer.clone(),
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            RULE_COMMENT.into(),
            "-j".into(),
            "DROP".into(),
        ]
    }

    fn with_op(&self, op: &str) -> Vec<String> {
        let mut args = vec![op.to_string()];
        args.extend(self.rule_spec());
        args
    }

    /// Arguments for `iptables -C` (exit 0 if the rule exists).
    pub fn to_check_args(&self) -> Vec<String> {
        self.with_op("-C")
    }

    /// Arguments for `iptables -I` (insert at the top of the chain).
    pub fn to_insert_args(&self) -> Vec<String> {
        self.with_op("-I")
    }

    /// Arguments for `iptables -D` (delete one copy).
    pub fn to_delete_args(&self) -> Vec<String> {
        self.with_op("-D")
    }

    fn command(&self, args: &[String]) -> String {
        let prefix = if self.sudo { "sudo iptables" } else { "iptables" };
        format!("{} {}", prefix, args.join(" "))
    }

    /// Arguments for `iptables -S` on the rule's chain.
    pub fn to_list_args(&self) -> Vec<String> {
        let chain = match self.direction {
            Direction::FromPeer => "INPUT",
            Direction::ToPeer => "OUTPUT",
        };
        vec!["-S".into(), chain.into()]
    }

    /// Shell snippet inserting the rule only if it is not already present.
    ///
    /// Running it twice leaves exactly one copy of the rule. Runs in a
    /// subshell so it composes with `&&`; exits non-zero if the insert fails.
    pub fn ensure_script(&self) -> String {
        format!(
            "( {} 2>/dev/null || {} )",
            self.command(&self.to_check_args()),
            self.command(&self.to_insert_args())
        )
    }

    /// Shell snippet deleting every copy of the rule; succeeds if none exist.
    ///
    /// Listing the chain first makes a missing binary or a refused `sudo`
    /// fail the script instead of reading as "no rule present". A failed
    /// delete also fails it.
    pub fn remove_script(&self) -> String {
        format!(
            "( {} >/dev/null && while {} 2>/dev/null; do {} || exit 1; done )",
            self.command(&self.to_list_args()),
            self.command(&self.to_check_args()),
            self.command(&self.to_delete_args())
        )
    }
}

/// Both-direction block against one peer as a single shell script.
///
/// Exits zero only if both rules are in place.
pub fn block_peer_script(peer: &str, sudo: bool) -> String {
    format!(
        "{} && {}",
        IptablesRule::drop_from(peer).sudo(sudo).ensure_script(),
        IptablesRule::drop_to(peer).sudo(sudo).ensure_script()
    )
}

/// Remove both directions of a peer block as a single shell script.
///
/// Exits zero only if neither rule remains.
pub fn unblock_peer_script(peer: &str, sudo: bool) -> String {
    format!(
        "{} && {}",
        IptablesRule::drop_from(peer).sudo(sudo).remove_script(),
        IptablesRule::drop_to(peer).sudo(sudo).remove_script()
    )
}
