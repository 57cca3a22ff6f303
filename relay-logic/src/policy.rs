//! 命令风险策略
//!
//! 纯函数：消息类型 + 命令原文 → 风险等级 / 决定 / 命中规则。
//! 规则按 critical → high → medium → low 分层，第一个有命中的层决定等级，
//! 原因只收集该层内的命中项。

use regex::Regex;
use relay_store::{PolicyDecision, PolicySnapshot, RiskLevel};
use std::sync::OnceLock;

/// 只有这种消息类型才会进入策略评估
pub const EXECUTE_COMMAND: &str = "execute_command";

pub const NON_EXECUTE_RULE_ID: &str = "non-execute-default-allow";
pub const SAFE_COMMAND_RULE_ID: &str = "safe-command-default-allow";

pub type PolicyResult = PolicySnapshot;

struct RuleDef {
    id: &'static str,
    pattern: &'static str,
    reason: &'static str,
}

const CRITICAL_RULES: &[RuleDef] = &[
    RuleDef {
        id: "critical.mkfs",
        pattern: r"(?i)\bmkfs(\.\w+)?\b",
        reason: "filesystem format",
    },
    RuleDef {
        id: "critical.format-drive",
        pattern: r"(?i)\bformat\s+[a-z]:",
        reason: "filesystem format",
    },
    RuleDef {
        id: "critical.dd-device",
        pattern: r"\bdd\b.*\bof=/dev/",
        reason: "raw disk write",
    },
    RuleDef {
        id: "critical.redirect-device",
        pattern: r">\s*/dev/(sd|hd|nvme|disk|mmcblk|xvd)",
        reason: "raw disk write",
    },
    RuleDef {
        id: "critical.rm-root",
        pattern: r"\brm\s+(?:-\S*\s+)*-\S*[rR]\S*\s+(?:-\S+\s+)*/\*?(?:\s|$)",
        reason: "recursive delete of filesystem root",
    },
    RuleDef {
        id: "critical.power",
        pattern: r"\b(shutdown|reboot|halt|poweroff)\b",
        reason: "power control",
    },
    RuleDef {
        id: "critical.init-runlevel",
        pattern: r"\binit\s+[06]\b",
        reason: "power control",
    },
    RuleDef {
        id: "critical.fork-bomb",
        pattern: r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        reason: "fork bomb",
    },
];

const HIGH_RULES: &[RuleDef] = &[
    RuleDef {
        id: "high.sudo",
        pattern: r"\bsudo\b",
        reason: "privilege escalation",
    },
    RuleDef {
        id: "high.su",
        pattern: r"(?:^|[;&|]\s*)su(?:\s|$)",
        reason: "privilege escalation",
    },
    RuleDef {
        id: "high.git-reset-hard",
        pattern: r"\bgit\s+reset\b.*--hard\b",
        reason: "destructive git operation: reset --hard",
    },
    RuleDef {
        id: "high.git-clean",
        pattern: r"\bgit\s+clean\b.*\s-[a-zA-Z]*f",
        reason: "destructive git operation: clean -f",
    },
    RuleDef {
        id: "high.git-force-push",
        pattern: r"\bgit\s+push\b.*(?:--force\b|--force-with-lease\b|\s-f\b)",
        reason: "destructive git operation: force push",
    },
    RuleDef {
        id: "high.git-branch-force-delete",
        pattern: r"\bgit\s+branch\b.*(?:\s-D\b|--delete\s+--force\b|--force\s+--delete\b)",
        reason: "destructive git operation: force branch delete",
    },
    RuleDef {
        id: "high.rm-rf",
        // 递归和强制两个参数任意顺序、长短写法都算，参数不跨越 ; & |
        pattern: concat!(
            r"\brm\s+(?:[^\s;&|]+\s+)*?",
            r"(?:",
            r"-[a-zA-Z]*(?:[rR][a-zA-Z]*f|f[a-zA-Z]*[rR])[a-zA-Z]*",
            r"|(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)(?:\s+[^\s;&|]+)*?\s+(?:-[a-zA-Z]*f[a-zA-Z]*|--force)",
            r"|(?:-[a-zA-Z]*f[a-zA-Z]*|--force)(?:\s+[^\s;&|]+)*?\s+(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)",
            r")(?:\s|$)"
        ),
        reason: "recursive force delete",
    },
];

const MEDIUM_RULES: &[RuleDef] = &[
    RuleDef {
        id: "medium.chmod-777",
        pattern: r"\bchmod\s+(?:-\S+\s+)*0?777\b",
        reason: "overly permissive chmod 777",
    },
    RuleDef {
        id: "medium.chown",
        pattern: r"\bchown\b",
        reason: "ownership change",
    },
    RuleDef {
        id: "medium.docker-destructive",
        pattern: r"\bdocker\s+(?:(?:container|image|volume|network|system)\s+)?(?:rm|rmi|prune|kill)\b",
        reason: "destructive container operation",
    },
    RuleDef {
        id: "medium.kubectl-delete",
        pattern: r"\bkubectl\s+delete\b",
        reason: "destructive cluster operation",
    },
];

const LOW_RULES: &[RuleDef] = &[
    RuleDef {
        id: "low.git-push",
        pattern: r"\bgit\s+push\b",
        reason: "publishes commits to a remote",
    },
    RuleDef {
        id: "low.package-install",
        pattern: r"\b(?:(?:npm|pnpm|yarn)\s+(?:install|add|i)|pip3?\s+install|cargo\s+install|brew\s+install|apt(?:-get)?\s+install)\b",
        reason: "installs packages",
    },
];

struct CompiledRule {
    id: &'static str,
    regex: Regex,
    reason: &'static str,
}

struct Tier {
    level: RiskLevel,
    rules: Vec<CompiledRule>,
}

fn tiers() -> &'static [Tier] {
    static TIERS: OnceLock<Vec<Tier>> = OnceLock::new();
    TIERS.get_or_init(|| {
        [
            (RiskLevel::Critical, CRITICAL_RULES),
            (RiskLevel::High, HIGH_RULES),
            (RiskLevel::Medium, MEDIUM_RULES),
            (RiskLevel::Low, LOW_RULES),
        ]
        .into_iter()
        .map(|(level, defs)| Tier {
            level,
            rules: defs
                .iter()
                .map(|def| CompiledRule {
                    id: def.id,
                    regex: Regex::new(def.pattern).expect("policy rule pattern must compile"),
                    reason: def.reason,
                })
                .collect(),
        })
        .collect()
    })
}

/// 风险等级对应的决定
pub fn decision_for(level: RiskLevel) -> PolicyDecision {
    match level {
        RiskLevel::Critical => PolicyDecision::Deny,
        RiskLevel::High | RiskLevel::Medium => PolicyDecision::ApprovalRequired,
        RiskLevel::Low => PolicyDecision::Allow,
    }
}

fn default_allow(rule_id: &str) -> PolicyResult {
    PolicySnapshot {
        risk_level: RiskLevel::Low,
        reasons: Vec::new(),
        decision: PolicyDecision::Allow,
        rule_id: rule_id.to_string(),
    }
}

/// 评估一条消息
pub fn evaluate(message_type: &str, command_raw: Option<&str>) -> PolicyResult {
    let command = match command_raw.map(str::trim) {
        Some(command) if message_type == EXECUTE_COMMAND && !command.is_empty() => command,
        _ => return default_allow(NON_EXECUTE_RULE_ID),
    };

    for tier in tiers() {
        let matched: Vec<&CompiledRule> = tier
            .rules
            .iter()
            .filter(|rule| rule.regex.is_match(command))
            .collect();

        let Some(first) = matched.first() else {
            continue;
        };

        let mut reasons: Vec<String> = Vec::with_capacity(matched.len());
        for rule in &matched {
            if !reasons.iter().any(|r| r == rule.reason) {
                reasons.push(rule.reason.to_string());
            }
        }

        return PolicySnapshot {
            risk_level: tier.level,
            reasons,
            decision: decision_for(tier.level),
            rule_id: first.id.to_string(),
        };
    }

    default_allow(SAFE_COMMAND_RULE_ID)
}
