use url::Url;

/// Appends a relative path to a base URL, tolerating slashes on either side.
///
/// ```
/// use url::Url;
///
/// let bare = Url::parse("http://host:555").expect("valid URL");
/// let slashed = Url::parse("http://host:555/").expect("valid URL");
/// assert_eq!(
///     twaindirect::append_path(&bare, "/privet/infoex"),
///     twaindirect::append_path(&slashed, "/privet/infoex"),
/// );
/// ```
#[must_use]
pub fn append_path(base: &Url, path: &str) -> Url {
    let mut joined_path = base.path().to_string();
    if !joined_path.ends_with('/') {
        joined_path.push('/');
    }
    joined_path.push_str(path.trim_start_matches('/'));

    let mut url = base.clone();
    url.set_path(&joined_path);
    url
}
