use std::path::Path;

use crate::validation::route_name;

const FRAGMENT_PREFIX: &str = "codedock-";
const FRAGMENT_SUFFIX: &str = ".conf";

/// Externally reachable path of a repository's editor.
pub fn public_path(namespace: &str, repo_id: &str) -> String {
    format!("/{}/{}/", namespace, route_name(repo_id))
}

pub fn fragment_file_name(route: &str) -> String {
    format!("{}{}{}", FRAGMENT_PREFIX, route, FRAGMENT_SUFFIX)
}

/// Inverse of [`fragment_file_name`]; `None` for files this crate does not manage.
pub fn route_from_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(FRAGMENT_PREFIX)?
        .strip_suffix(FRAGMENT_SUFFIX)
        .filter(|route| !route.is_empty())
}

/// Render an nginx `location` fragment for inclusion inside the panel's `server` block.
pub fn render_fragment(
    namespace: &str,
    repo_id: &str,
    upstream_host: &str,
    port: u16,
    working_dir: &Path,
) -> String {
    let route = route_name(repo_id);
    let prefix = format!("/{}/{}", namespace, route);
    format!(
        r"# Managed by codedock. Changes are overwritten.
# repository: {repo}
# workspace: {workspace}
location {prefix}/ {{
    proxy_pass http://{upstream_host}:{port}/;
    proxy_http_version 1.1;
    proxy_set_header Host $http_host;
    proxy_set_header Upgrade $http_upgrade;
    proxy_set_header Connection upgrade;
    proxy_set_header Accept-Encoding gzip;
    proxy_set_header X-Forwarded-Prefix {prefix};
    proxy_read_timeout 86400s;
    proxy_send_timeout 86400s;
}}

location = {prefix} {{
    return 301 {prefix}/;
}}
",
        repo = comment_safe(repo_id),
        workspace = comment_safe(&working_dir.display().to_string()),
    )
}

fn comment_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_path_uses_route_name() {
        assert_eq!(public_path("ns", "RepoA"), "/ns/repoa/");
        assert_eq!(public_path("code", "my repo"), "/code/my-repo/");
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(fragment_file_name("repoa"), "codedock-repoa.conf");
        assert_eq!(route_from_file_name("codedock-repoa.conf"), Some("repoa"));
        assert_eq!(route_from_file_name("codedock-.conf"), None);
        assert_eq!(route_from_file_name("default.conf"), None);
        assert_eq!(route_from_file_name(".codedock-repoa.conf.1234.tmp"), None);
    }

    #[test]
    fn fragment_proxies_with_upgrade_headers() {
        let fragment = render_fragment(
            "code",
            "RepoA",
            "localhost",
            9003,
            Path::new("/srv/repos/RepoA"),
        );
        assert!(fragment.contains("location /code/repoa/ {"));
        assert!(fragment.contains("proxy_pass http://localhost:9003/;"));
        assert!(fragment.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(fragment.contains("proxy_set_header Connection upgrade;"));
        assert!(fragment.contains("return 301 /code/repoa/;"));
        assert!(fragment.contains("# workspace: /srv/repos/RepoA"));
    }

    #[test]
    fn comments_cannot_break_out() {
        let fragment = render_fragment(
            "code",
            "a",
            "localhost",
            9000,
            Path::new("/srv/evil\n}\nlocation / {"),
        );
        assert!(fragment.contains("# workspace: /srv/evil } location / {"));
    }
}
