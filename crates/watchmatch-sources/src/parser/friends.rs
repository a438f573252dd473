use super::selector;
use crate::error::SourceError;
use scraper::Html;
use std::collections::HashSet;
use watchmatch_models::{Friend, FriendId};

#[derive(Debug, Clone, Default)]
pub struct FriendsPage {
    pub friends: Vec<Friend>,
    pub has_next: bool,
}

/// Parse one page of the accounts `owner` follows.
///
/// Each followed account is an `a.avatar` link whose first path segment is
/// the handle; the avatar image's `alt` text is used as display name.
pub fn parse_friends_page(body: &str, owner: &FriendId) -> Result<FriendsPage, SourceError> {
    let lowered = body.trim_start().to_ascii_lowercase();
    if !(lowered.starts_with("<!doctype html") || lowered.starts_with("<html") || lowered.contains("avatar")) {
        return Err(SourceError::Parse("following page is not HTML".to_string()));
    }

    let document = Html::parse_document(body);
    let avatar_selector = selector("a.avatar")?;
    let img_selector = selector("img[alt]")?;
    let next_selector = selector("a.next")?;

    let mut seen = HashSet::new();
    let mut friends = Vec::new();
    for avatar in document.select(&avatar_selector) {
        let Some(href) = avatar.value().attr("href") else {
            continue;
        };
        let Some(handle) = href.trim_matches('/').split('/').next().filter(|h| !h.is_empty()) else {
            continue;
        };

        let friend_id = FriendId::new(handle);
        if &friend_id == owner || !seen.insert(friend_id) {
            continue;
        }

        let display_name = avatar
            .select(&img_selector)
            .next()
            .and_then(|img| img.value().attr("alt"))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(handle);

        friends.push(Friend::new(handle, display_name));
    }

    Ok(FriendsPage {
        friends,
        has_next: document.select(&next_selector).next().is_some(),
    })
}
