//! Filters a token's groups into the `(SID, attributes)` lists the restricted-token APIs take,
//! and pulls out the Logon SID along the way (spec §4.3).

use anyhow::Result;
use win_api_wrappers::identity::sid::{SidAndAttributes, WELL_KNOWN};
use win_api_wrappers::token::Token;
use windows::Win32::Security::Authorization::SE_GROUP_LOGON_ID;
use windows::Win32::Security::SE_GROUP_INTEGRITY;

/// Skip groups whose attributes include `SE_GROUP_INTEGRITY`.
pub const FILTER_INTEGRITY: u32 = 0x1;
/// Skip Logon-ID, Everyone, and Users; capture the Logon SID before skipping it.
pub const FILTER_RESTRICTED_DISABLE: u32 = 0x2;
/// Append the well-known Restricted-Code SID after filtering.
pub const FILTER_ADD_RESTRICTED: u32 = 0x4;

/// Snapshots `token`'s groups and applies `filter_flags`, returning the surviving
/// `(SID, attributes)` entries plus the Logon SID if `FILTER_RESTRICTED_DISABLE` captured one.
pub fn create_from_token_groups(token: &Token, filter_flags: u32) -> Result<(Vec<SidAndAttributes>, Option<win_api_wrappers::identity::sid::Sid>)> {
    let groups = token.groups()?;

    // Reserve for every surviving group plus the restricted-code SID appended below, so the
    // vector never reallocates once a caller starts taking raw pointers into it (spec §9).
    let mut out = Vec::with_capacity(groups.len() + 1);
    let mut logon_sid = None;

    for group in groups {
        if filter_flags & FILTER_INTEGRITY != 0 && group.attributes & SE_GROUP_INTEGRITY.0 != 0 {
            continue;
        }

        if filter_flags & FILTER_RESTRICTED_DISABLE != 0 {
            if group.attributes & SE_GROUP_LOGON_ID.0 != 0 {
                logon_sid = Some(group.sid);
                continue;
            }

            if group.sid == *WELL_KNOWN.everyone() || group.sid == *WELL_KNOWN.builtin_users() {
                continue;
            }
        }

        out.push(group);
    }

    if filter_flags & FILTER_ADD_RESTRICTED != 0 {
        out.push(SidAndAttributes { sid: WELL_KNOWN.restricted_code().clone(), attributes: 0 });
    }

    Ok((out, logon_sid))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use windows::Win32::Security::{TOKEN_DUPLICATE, TOKEN_QUERY};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn restricted_disable_filter_never_keeps_everyone_or_users() {
        let token = Token::current_process_token(TOKEN_QUERY | TOKEN_DUPLICATE).unwrap();
        let (filtered, _logon_sid) = create_from_token_groups(&token, FILTER_RESTRICTED_DISABLE).unwrap();

        assert!(filtered.iter().all(|g| g.sid != *WELL_KNOWN.everyone() && g.sid != *WELL_KNOWN.builtin_users()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn add_restricted_appends_restricted_code_sid() {
        let token = Token::current_process_token(TOKEN_QUERY | TOKEN_DUPLICATE).unwrap();
        let (filtered, _) = create_from_token_groups(&token, FILTER_ADD_RESTRICTED).unwrap();

        assert!(filtered.last().is_some_and(|g| g.sid == *WELL_KNOWN.restricted_code()));
    }
}
