//! Pre-shipped search extension groups.
//!
//! Outgoing searches compress long extension lists into a `GR` bitmask over
//! these groups plus `EX` additions and `RX` exclusions; inbound searches
//! expand the mask back into plain extensions.

/// Number of shipped groups.
pub const GROUP_COUNT: usize = 6;

/// Extension groups, in `GR` bit order. Each list is sorted.
pub const GROUPS: [&[&str]; GROUP_COUNT] = [
    // audio
    &["ape", "flac", "m4a", "mid", "mp3", "mpc", "ogg", "ra", "wav", "wma"],
    // archive
    &["7z", "ace", "arj", "bz2", "gz", "lha", "lzh", "rar", "tar", "z", "zip"],
    // document
    &[
        "doc", "docx", "htm", "html", "nfo", "odf", "odp", "ods", "odt", "pdf", "ppt", "pptx",
        "rtf", "txt", "xls", "xlsx", "xml", "xps",
    ],
    // executable
    &["app", "bat", "cmd", "com", "dll", "exe", "jar", "msi", "ps1", "vbs", "wsf"],
    // picture
    &[
        "bmp", "cdr", "eps", "gif", "ico", "img", "jpeg", "jpg", "png", "ps", "psd", "sfw",
        "tga", "tif", "webp",
    ],
    // video
    &[
        "3gp", "asf", "asx", "avi", "divx", "flv", "mkv", "mov", "mp4", "mpeg", "mpg", "ogm",
        "pxp", "qt", "rm", "rmvb", "swf", "vob", "webm", "wmv",
    ],
];

/// Expand a `GR` bitmask into the union of its groups' extensions.
#[must_use]
pub fn expand_groups(mask: u8) -> Vec<String> {
    let mut out = Vec::new();
    for (i, group) in GROUPS.iter().enumerate() {
        if mask & (1 << i) != 0 {
            out.extend(group.iter().map(|e| (*e).to_string()));
        }
    }
    out
}

/// Result of compacting an extension list against the shipped groups.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GroupedExtensions {
    /// `GR` bitmask of fully- or mostly-covered groups.
    pub mask: u8,
    /// Extensions still to send as `EX` (not covered by any used group).
    pub extra: Vec<String>,
    /// Group members the sender does *not* want, sent as `RX`.
    pub excluded: Vec<String>,
}

/// Compact a sorted, lower-cased extension list against the shipped groups.
///
/// A group is used when at most two of its members are unwanted (those
/// become `RX` tokens). Returns `None` when no group helps, in which case
/// the caller sends plain `EX` parameters.
#[must_use]
pub fn compact(extensions: &[String]) -> Option<GroupedExtensions> {
    if extensions.len() <= 2 {
        return None;
    }

    let mut remaining: Vec<String> = extensions.to_vec();
    remaining.sort();
    remaining.dedup();

    let mut grouped = GroupedExtensions::default();

    for (i, group) in GROUPS.iter().enumerate() {
        // Partition the symmetric difference into additions (ours, not in
        // the group) and rejections (group members we did not ask for).
        let mut additions = Vec::new();
        let mut rejections = Vec::new();
        let mut matched = 0usize;
        {
            let group_set: std::collections::BTreeSet<&str> =
                group.iter().copied().collect();
            for e in &remaining {
                if group_set.contains(e.as_str()) {
                    matched += 1;
                } else {
                    additions.push(e.clone());
                }
            }
            for g in group.iter() {
                if !remaining.iter().any(|e| e == g) {
                    rejections.push((*g).to_string());
                }
            }
        }

        if matched == 0 || rejections.len() > 2 {
            continue;
        }

        grouped.mask |= 1 << i;
        grouped.excluded.extend(rejections);
        remaining = additions;

        if remaining.len() <= 2 {
            break;
        }
    }

    if grouped.mask == 0 {
        return None;
    }

    grouped.extra = remaining;
    Some(grouped)
}
