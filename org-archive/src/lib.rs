//! Hierarchical archiving for Org outlines.
//! The core stays pure: parsing, merging and formatting are value transformations,
//! and every touch of the filesystem sits behind the `storage` traits.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    /* ------------------------------ Tree model ------------------------------ */

    /// One outline heading, or the virtual document root.
    ///
    /// Equality is structural and positional: heading, body, and children compared
    /// pairwise in order.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Node {
        /// Heading text without the star marker. Assumed unique among siblings.
        pub heading: String,

        /// Text between the headline and the first child heading, kept verbatim.
        #[serde(default)]
        pub body: String,

        /// Child headings in document order.
        #[serde(default)]
        pub children: Vec<Node>,
    }

    impl Node {
        /// Heading carried by the document root.
        pub const ROOT_HEADING: &'static str = "ROOT";

        pub fn new(heading: impl Into<String>, body: impl Into<String>, children: Vec<Node>) -> Self {
            Self {
                heading: heading.into(),
                body: body.into(),
                children,
            }
        }

        pub fn leaf(heading: impl Into<String>, body: impl Into<String>) -> Self {
            Self::new(heading, body, vec![])
        }

        /// Document root; `preamble` is everything before the first headline.
        pub fn root(preamble: impl Into<String>) -> Self {
            Self::new(Self::ROOT_HEADING, preamble, vec![])
        }

        pub fn heading(&self) -> &str {
            &self.heading
        }

        pub fn body(&self) -> &str {
            &self.body
        }

        pub fn children(&self) -> &[Node] {
            &self.children
        }

        /// Same heading and body, with the child at `index` swapped for `child`.
        ///
        /// # Panics
        ///
        /// Panics if `index` is out of bounds.
        pub fn replace_child(mut self, index: usize, child: Node) -> Self {
            self.children[index] = child;
            self
        }

        /// Same heading and body, with `child` placed in front of the existing children.
        pub fn graft_child(mut self, child: Node) -> Self {
            self.children.insert(0, child);
            self
        }

        /// Index of the first child whose heading equals `heading`.
        ///
        /// A trailing `\r` left by CRLF line endings is ignored on both sides.
        pub fn position_of(&self, heading: &str) -> Option<usize> {
            self.children
                .iter()
                .position(|c| same_heading(&c.heading, heading))
        }

        /// Follow `path` down from this node, taking the first match at every level.
        pub fn find_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Node> {
            path.iter().try_fold(self, |node, heading| {
                node.position_of(heading.as_ref())
                    .map(|idx| &node.children[idx])
            })
        }
    }

    fn same_heading(a: &str, b: &str) -> bool {
        a.strip_suffix('\r').unwrap_or(a) == b.strip_suffix('\r').unwrap_or(b)
    }

    /// A heading enclosing the subtree being archived, without its other children.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Ancestor {
        pub heading: String,
        pub body: String,
    }

    impl Ancestor {
        pub fn new(heading: impl Into<String>, body: impl Into<String>) -> Self {
            Self {
                heading: heading.into(),
                body: body.into(),
            }
        }
    }

    impl From<&Node> for Ancestor {
        fn from(node: &Node) -> Self {
            Self::new(node.heading.clone(), node.body.clone())
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ArchiveError {
        #[error(
            "no archive file configured (use --archive-file, ORG_ARCHIVE_FILE, or `archive_file` in the config)"
        )]
        MissingArchiveTarget,
        #[error("{0:?} is not a recognized archive source")]
        UnrecognizedSource(PathBuf),
        #[error("archive file {0:?} is the source document itself")]
        ArchiveIsSource(PathBuf),
        #[error("no heading at line {line} of {path:?}")]
        NoHeadingAtLine { path: PathBuf, line: usize },
        #[error("no heading at outline path {olp:?} in {path:?}")]
        NoHeadingAtPath { path: PathBuf, olp: String },
        #[error("invalid config {path:?}: {source}")]
        ConfigParse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
    }

}

pub mod parser {
    //! Line-oriented outline parser built on `nom`.
    //!
    //! A headline is one or more `*` followed by a single space; the star count is
    //! its depth. Every other line is body text owned by the nearest preceding
    //! headline, or by the root before the first one. The tree is stack-built by
    //! depth: a headline closes every open heading at the same or greater depth and
    //! becomes a child of whatever remains open. A depth that skips levels therefore
    //! attaches to the nearest shallower heading.
    //!
    //! Only `\n` terminates a line, so `\r` stays in headings and bodies and CRLF
    //! documents survive a round trip.

    use crate::core::Node;
    use crate::storage::OutlineParser;
    use anyhow::{Context, Result, anyhow};
    use nom::{
        IResult,
        bytes::complete::{take_till, take_while1},
        character::complete::char,
        combinator::{map, opt, recognize},
        error::VerboseError,
        sequence::{pair, tuple},
    };
    use std::{fs, path::Path};

    /* ------------------------ Public entry points ------------------------ */

    /// Parse an outline document into its root node.
    pub fn parse_outline(input: &str) -> Result<Node> {
        let mut root = Node::root("");
        let mut open: Vec<(usize, Node)> = Vec::new();
        let mut rest = input;

        while !rest.is_empty() {
            if let Ok((r, (depth, heading))) = headline(rest) {
                close_open(&mut root, &mut open, depth);
                open.push((depth, Node::leaf(heading, "")));
                rest = r;
                continue;
            }

            let (r, line) = raw_line(rest).map_err(to_anyhow("body line"))?;
            match open.last_mut() {
                Some((_, node)) => node.body.push_str(line),
                None => root.body.push_str(line),
            }
            rest = r;
        }

        close_open(&mut root, &mut open, 0);
        Ok(root)
    }

    /// Concrete parser implementing the `storage::OutlineParser` trait.
    pub struct NomOutlineParser;

    impl OutlineParser for NomOutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Node> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            parse_outline(&text).with_context(|| format!("parsing {:?}", abs_path))
        }
    }

    /* ------------------------------- Tree ------------------------------- */

    /// Pop every open heading at `depth` or deeper, attaching each to its parent.
    fn close_open(root: &mut Node, open: &mut Vec<(usize, Node)>, depth: usize) {
        while open.last().is_some_and(|(d, _)| *d >= depth) {
            let Some((_, done)) = open.pop() else {
                break;
            };
            match open.last_mut() {
                Some((_, parent)) => parent.children.push(done),
                None => root.children.push(done),
            }
        }
    }

    /* ------------------------------ Lines ------------------------------ */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn to_anyhow(label: &'static str) -> impl Fn(nom::Err<VerboseError<&str>>) -> anyhow::Error {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                let at = ve
                    .errors
                    .first()
                    .map(|(frag, kind)| format!("{:?} ({:?})", first_line(frag), kind))
                    .unwrap_or_default();
                anyhow!("parse error in {}: {}", label, at)
            }
            nom::Err::Incomplete(_) => anyhow!("incomplete input while parsing {}", label),
        }
    }

    fn first_line(s: &str) -> &str {
        s.split('\n').next().unwrap_or(s)
    }

    fn stars(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c == '*')(i)
    }

    fn space(i: &str) -> PResult<'_, char> {
        char(' ')(i)
    }

    fn newline(i: &str) -> PResult<'_, char> {
        char('\n')(i)
    }

    fn rest_of_line(i: &str) -> PResult<'_, &str> {
        take_till(|c: char| c == '\n')(i)
    }

    /// `*** Heading text\n` → `(3, "Heading text")`.
    fn headline(i: &str) -> PResult<'_, (usize, &str)> {
        map(
            tuple((stars, space, rest_of_line, opt(newline))),
            |(marker, _, heading, _)| (marker.len(), heading),
        )(i)
    }

    /// One line including its terminator, if any.
    fn raw_line(i: &str) -> PResult<'_, &str> {
        recognize(pair(rest_of_line, opt(newline)))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::{headline, parse_outline};
        use crate::core::Node;
        use crate::format::format_outline;
        use rstest::rstest;

        #[test]
        fn headline_counts_stars_and_keeps_title() {
            let (rest, (depth, title)) = headline("*** TODO Fence :garden:\nbody\n").unwrap();
            assert_eq!(depth, 3);
            assert_eq!(title, "TODO Fence :garden:");
            assert_eq!(rest, "body\n");
        }

        #[test]
        fn emphasis_and_bare_stars_are_not_headlines() {
            assert!(headline("*bold* words\n").is_err());
            assert!(headline("**\n").is_err());
            assert!(headline(" * indented\n").is_err());
        }

        #[test]
        fn document_without_headings_is_all_root_body() {
            let text = "#+title: Notes\n\nJust prose.\n";
            let root = parse_outline(text).expect("parse");
            assert_eq!(root.heading(), Node::ROOT_HEADING);
            assert_eq!(root.body(), text);
            assert!(root.children().is_empty());
        }

        #[test]
        fn empty_document_is_empty_root() {
            assert_eq!(parse_outline("").expect("parse"), Node::root(""));
        }

        #[test]
        fn builds_nested_tree_with_verbatim_bodies() {
            let text = "preamble\n* A\na body\n\n** B\nb body\n** C\n* D\n  indented d\n";
            let root = parse_outline(text).expect("parse");

            assert_eq!(root.body(), "preamble\n");
            let expected = vec![
                Node::new(
                    "A",
                    "a body\n\n",
                    vec![Node::leaf("B", "b body\n"), Node::leaf("C", "")],
                ),
                Node::leaf("D", "  indented d\n"),
            ];
            assert_eq!(root.children(), expected.as_slice());
        }

        #[test]
        fn body_stops_at_first_child_heading() {
            let root = parse_outline("* A\nbefore\n** B\nafter\n").expect("parse");
            let a = &root.children()[0];
            assert_eq!(a.body(), "before\n");
            assert_eq!(a.children()[0].body(), "after\n");
        }

        #[test]
        fn skipped_depth_attaches_to_nearest_shallower_heading() {
            let root = parse_outline("* A\n*** C\n** B\n").expect("parse");
            let a = &root.children()[0];
            let order: Vec<_> = a.children().iter().map(Node::heading).collect();
            assert_eq!(order, ["C", "B"]);
            assert_eq!(format_outline(&root), "* A\n** C\n** B\n");
        }

        #[test]
        fn leading_deep_heading_attaches_to_root() {
            let root = parse_outline("** Orphan\n* Top\n").expect("parse");
            let order: Vec<_> = root.children().iter().map(Node::heading).collect();
            assert_eq!(order, ["Orphan", "Top"]);
        }

        #[test]
        fn carriage_returns_are_kept() {
            let text = "* A\r\nline\r\n";
            let root = parse_outline(text).expect("parse");
            assert_eq!(root.children()[0].heading(), "A\r");
            assert_eq!(root.children()[0].body(), "line\r\n");
        }

        #[rstest]
        #[case::flat("* A\n* B\n* C\n")]
        #[case::deep("* 1\n** 2\n*** 3\n**** 4\n***** 5\ntext\n")]
        #[case::bodies("intro\n\n* A\n:PROPERTIES:\n:ID: x\n:END:\n** B\n\n\n* C\n")]
        #[case::siblings_after_depth("* A\n** B\n*** C\n** D\n* E\n** F\n")]
        #[case::crlf("pre\r\n* A\r\nbody\r\n** B\r\n")]
        #[case::body_without_final_newline("* A\nlast line")]
        #[case::empty_heading("* \n** child\n")]
        fn serialize_parse_round_trips(#[case] text: &str) {
            let root = parse_outline(text).expect("parse");
            let formatted = format_outline(&root);
            assert_eq!(formatted, text);
            assert_eq!(parse_outline(&formatted).expect("reparse"), root);
        }
    }
}

pub mod format {
    //! Outline serializer: the inverse of `parser::parse_outline`.

    use crate::core::Node;

    /// Render a root node back into outline text.
    pub fn format_outline(root: &Node) -> String {
        let mut out = String::with_capacity(root.body.len());
        out.push_str(&root.body);
        for child in &root.children {
            format_subtree(&mut out, child, 1);
        }
        out
    }

    /// Render `node` at `depth` stars, followed by its descendants one level deeper.
    pub fn format_subtree(out: &mut String, node: &Node, depth: usize) {
        // A body that lost its trailing newline (end of file) can end up followed by
        // a grafted heading; the headline still needs a line of its own.
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.extend(std::iter::repeat_n('*', depth));
        out.push(' ');
        out.push_str(&node.heading);
        out.push('\n');
        out.push_str(&node.body);
        for child in &node.children {
            format_subtree(out, child, depth + 1);
        }
    }

}

pub mod path {
    //! Turns a heading and its ancestor chain into a single-branch path tree.

    use crate::core::{Ancestor, Node};

    /// Wrap `subtree` in each ancestor, nearest first.
    ///
    /// The result's root is the outermost ancestor; its single-child chain ends at
    /// `subtree`, which keeps its own children.
    pub fn build_path(subtree: Node, ancestors: &[Ancestor]) -> Node {
        ancestors.iter().fold(subtree, |inner, ancestor| {
            Node::new(ancestor.heading.clone(), ancestor.body.clone(), vec![inner])
        })
    }

    /// `["a", "b", "c"]` → `a → b → c`, all with empty bodies.
    pub fn treeify<S: AsRef<str>>(headings: &[S]) -> Option<Node> {
        let (last, outer) = headings.split_last()?;
        let ancestors: Vec<Ancestor> = outer
            .iter()
            .rev()
            .map(|h| Ancestor::new(h.as_ref(), ""))
            .collect();
        Some(build_path(Node::leaf(last.as_ref(), ""), &ancestors))
    }

}

pub mod merge {
    //! Structural merge of a path tree into an archive tree.

    use crate::core::Node;
    use crate::format::format_outline;
    use crate::parser::parse_outline;
    use anyhow::Result;
    use tracing::debug;

    /// Merge `path_node` into the children of `tree`.
    ///
    /// The first child of `tree` with the same heading keeps its heading and body
    /// and absorbs each child of `path_node` in turn by the same rule. With no such
    /// child, `path_node` is grafted whole in front of the existing children and
    /// matching stops there.
    pub fn merge(tree: Node, path_node: Node) -> Node {
        let Some(idx) = tree.position_of(&path_node.heading) else {
            debug!(heading = %path_node.heading, parent = %tree.heading, "grafting new branch");
            return tree.graft_child(path_node);
        };

        debug!(heading = %path_node.heading, idx, "reusing archived branch");
        let mut tree = tree;
        let existing = std::mem::take(&mut tree.children[idx]);
        let merged = path_node.children.into_iter().fold(existing, merge);
        tree.replace_child(idx, merged)
    }

    /// Parse `archive_text`, merge `path_tree` into it, and render the result.
    pub fn merge_into_text(archive_text: &str, path_tree: Node) -> Result<String> {
        let archive = parse_outline(archive_text)?;
        Ok(format_outline(&merge(archive, path_tree)))
    }

}

pub mod storage {
    //! Seams to the outside world: where fragments come from and where archives live.

    use crate::core::{Ancestor, Node};
    use anyhow::{Context, Result};
    use std::{io::Write, path::Path};

    /// Parsing is independent of where the text is stored.
    pub trait OutlineParser {
        fn parse_file(&self, abs_path: &Path) -> Result<Node>;
    }

    /// The document a fragment is archived from, positioned at one heading.
    pub trait LiveDocument {
        /// Where the document lives; checked against the recognized sources.
        fn location(&self) -> &Path;

        /// The current heading with its body and full subtree.
        fn current_subtree(&self) -> Result<Node>;

        /// Enclosing headings, immediate parent first, excluding the document root.
        fn ancestors(&self) -> Result<Vec<Ancestor>>;

        fn current_heading(&self) -> Result<String> {
            Ok(self.current_subtree()?.heading)
        }
    }

    /// Deletes the current heading and its subtree, and persists the change.
    pub trait FragmentRemover {
        fn remove_current(&mut self) -> Result<()>;
    }

    /// Persistent archive document.
    pub trait ArchiveStore {
        fn location(&self) -> &Path;

        /// Current archive text; an archive that does not exist yet reads as empty.
        fn read(&self) -> Result<String>;

        /// Replace the archive text as a whole.
        fn write(&self, text: &str) -> Result<()>;
    }

    /// Write `text` to a temp file next to `path`, then rename it over `path`.
    pub fn write_atomically(path: &Path, text: &str) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {:?}", dir))?;
        tmp.write_all(text.as_bytes())
            .with_context(|| format!("writing temp file for {:?}", path))?;
        tmp.persist(path)
            .with_context(|| format!("replacing {:?}", path))?;
        Ok(())
    }

}

pub mod document {
    //! File-backed live document: a parsed `.org` file and a cursor on one heading.

    use crate::core::{Ancestor, ArchiveError, Node};
    use crate::format::format_outline;
    use crate::parser::NomOutlineParser;
    use crate::storage::{FragmentRemover, LiveDocument, OutlineParser, write_atomically};
    use anyhow::{Context, Result, anyhow};
    use std::path::{Path, PathBuf};
    use tracing::debug;

    #[derive(Debug, Clone)]
    pub struct OrgDocument {
        path: PathBuf,
        root: Node,
        /// Child indices from the root to the current heading; `None` once removed.
        cursor: Option<Vec<usize>>,
    }

    impl OrgDocument {
        /// Open `path` with the cursor on the heading that owns 1-based `line`.
        ///
        /// A heading owns its headline and its body lines; lines of a child heading
        /// belong to the child.
        pub fn at_line(path: impl Into<PathBuf>, line: usize) -> Result<Self> {
            let path = path.into();
            let root = NomOutlineParser.parse_file(&path)?;
            let cursor = heading_at_line(&root, line)
                .ok_or_else(|| ArchiveError::NoHeadingAtLine {
                    path: path.clone(),
                    line,
                })?;
            debug!(?path, line, ?cursor, "cursor placed by line");
            Ok(Self {
                path,
                root,
                cursor: Some(cursor),
            })
        }

        /// Open `path` with the cursor on the heading reached by `olp`, first match at each level.
        pub fn at_outline_path<S: AsRef<str>>(path: impl Into<PathBuf>, olp: &[S]) -> Result<Self> {
            let path = path.into();
            let root = NomOutlineParser.parse_file(&path)?;
            let cursor = index_path(&root, olp).ok_or_else(|| ArchiveError::NoHeadingAtPath {
                path: path.clone(),
                olp: olp
                    .iter()
                    .map(|s| s.as_ref())
                    .collect::<Vec<_>>()
                    .join("/"),
            })?;
            debug!(?path, ?cursor, "cursor placed by outline path");
            Ok(Self {
                path,
                root,
                cursor: Some(cursor),
            })
        }

        pub fn root(&self) -> &Node {
            &self.root
        }

        /// Nodes from the first top-level heading down to the current one.
        fn chain(&self) -> Result<Vec<&Node>> {
            let cursor = self
                .cursor
                .as_ref()
                .ok_or_else(|| anyhow!("no current heading in {:?}", self.path))?;
            let mut node = &self.root;
            let mut chain = Vec::with_capacity(cursor.len());
            for &idx in cursor {
                node = node
                    .children
                    .get(idx)
                    .ok_or_else(|| anyhow!("stale cursor in {:?}", self.path))?;
                chain.push(node);
            }
            Ok(chain)
        }
    }

    impl LiveDocument for OrgDocument {
        fn location(&self) -> &Path {
            &self.path
        }

        fn current_subtree(&self) -> Result<Node> {
            let chain = self.chain()?;
            chain
                .last()
                .map(|node| (*node).clone())
                .ok_or_else(|| anyhow!("no current heading in {:?}", self.path))
        }

        fn ancestors(&self) -> Result<Vec<Ancestor>> {
            let chain = self.chain()?;
            let Some((_, enclosing)) = chain.split_last() else {
                return Ok(vec![]);
            };
            Ok(enclosing.iter().rev().map(|node| Ancestor::from(*node)).collect())
        }
    }

    impl FragmentRemover for OrgDocument {
        fn remove_current(&mut self) -> Result<()> {
            let cursor = self
                .cursor
                .take()
                .ok_or_else(|| anyhow!("no current heading in {:?}", self.path))?;
            let (&last, parents) = cursor
                .split_last()
                .ok_or_else(|| anyhow!("cursor points at the document root"))?;

            let mut parent = &mut self.root;
            for &idx in parents {
                parent = parent
                    .children
                    .get_mut(idx)
                    .ok_or_else(|| anyhow!("stale cursor in {:?}", self.path))?;
            }
            if last >= parent.children.len() {
                return Err(anyhow!("stale cursor in {:?}", self.path));
            }
            let removed = parent.children.remove(last);
            debug!(heading = %removed.heading, path = ?self.path, "removed fragment");

            write_atomically(&self.path, &format_outline(&self.root))
                .with_context(|| format!("saving {:?}", self.path))
        }
    }

    /* ------------------------------ Cursor lookup ------------------------------ */

    fn line_span(text: &str) -> usize {
        text.lines().count()
    }

    fn heading_at_line(root: &Node, line: usize) -> Option<Vec<usize>> {
        let mut next = 1 + line_span(&root.body);
        let mut trail = Vec::new();
        locate(&root.children, line, &mut next, &mut trail).then_some(trail)
    }

    fn locate(nodes: &[Node], line: usize, next: &mut usize, trail: &mut Vec<usize>) -> bool {
        for (idx, node) in nodes.iter().enumerate() {
            if *next > line {
                return false;
            }
            trail.push(idx);
            let end = *next + 1 + line_span(&node.body);
            if (*next..end).contains(&line) {
                return true;
            }
            *next = end;
            if locate(&node.children, line, next, trail) {
                return true;
            }
            trail.pop();
        }
        false
    }

    fn index_path<S: AsRef<str>>(root: &Node, olp: &[S]) -> Option<Vec<usize>> {
        if olp.is_empty() {
            return None;
        }
        let mut node = root;
        let mut trail = Vec::with_capacity(olp.len());
        for heading in olp {
            let idx = node.position_of(heading.as_ref())?;
            trail.push(idx);
            node = &node.children[idx];
        }
        Some(trail)
    }

}

pub mod config {
    //! Settings for where archives go and which documents may feed them.
    //!
    //! Layering (lowest to highest): defaults, a TOML config file, then explicit
    //! overrides from the command line or environment.

    use crate::core::ArchiveError;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Archive document. `%s` expands to the source file name; relative paths
        /// resolve against the source file's directory.
        pub archive_file: Option<PathBuf>,

        /// Files or directories whose `.org` files may be archived from. Empty means any.
        pub recognized_sources: Vec<PathBuf>,
    }

    impl Settings {
        pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
            toml::from_str(text)
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
            let settings = Self::from_toml_str(&text).map_err(|source| ArchiveError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(settings)
        }

        /// Overlay an explicit archive file, if one was given.
        pub fn with_archive_file(mut self, archive_file: Option<PathBuf>) -> Self {
            if archive_file.is_some() {
                self.archive_file = archive_file;
            }
            self
        }

        /// Resolve the archive document for `source`.
        pub fn archive_target(&self, source: &Path) -> Result<PathBuf, ArchiveError> {
            let template = self
                .archive_file
                .as_ref()
                .ok_or(ArchiveError::MissingArchiveTarget)?;

            let expanded = match (template.to_str(), source.file_name()) {
                (Some(raw), Some(name)) if raw.contains("%s") => {
                    PathBuf::from(raw.replace("%s", &name.to_string_lossy()))
                }
                _ => template.clone(),
            };

            if expanded.is_relative() {
                if let Some(dir) = source.parent() {
                    return Ok(dir.join(expanded));
                }
            }
            Ok(expanded)
        }

        /// Whether `source` may be archived from.
        pub fn recognizes(&self, source: &Path) -> bool {
            let is_org = source.extension().is_some_and(|ext| ext == "org");
            is_org
                && (self.recognized_sources.is_empty()
                    || self
                        .recognized_sources
                        .iter()
                        .any(|known| source.starts_with(known)))
        }
    }

}

pub mod archive {
    //! The archive operation: path tree from the live document, merged into the
    //! archive tree, archive rewritten, fragment removed.
    //!
    //! Nothing is written until the merged text is ready, and the fragment is only
    //! removed after the archive write succeeded.

    use crate::config::Settings;
    use crate::core::ArchiveError;
    use crate::format::format_outline;
    use crate::merge::merge;
    use crate::parser::parse_outline;
    use crate::path::build_path;
    use crate::storage::{ArchiveStore, FragmentRemover, LiveDocument, write_atomically};
    use anyhow::{Context, Result};
    use serde::Serialize;
    use std::{
        fs,
        io::ErrorKind,
        path::{Path, PathBuf},
    };
    use tracing::{debug, info};

    /// Archive document stored as a plain file.
    #[derive(Debug, Clone)]
    pub struct FileArchive {
        path: PathBuf,
    }

    impl FileArchive {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl ArchiveStore for FileArchive {
        fn location(&self) -> &Path {
            &self.path
        }

        fn read(&self) -> Result<String> {
            match fs::read_to_string(&self.path) {
                Ok(text) => Ok(text),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = ?self.path, "archive does not exist yet");
                    Ok(String::new())
                }
                Err(err) => Err(err).with_context(|| format!("reading archive {:?}", self.path)),
            }
        }

        fn write(&self, text: &str) -> Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {:?}", parent))?;
            }
            write_atomically(&self.path, text)
                .with_context(|| format!("writing archive {:?}", self.path))
        }
    }

    /// What an archive operation did (or would do).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ArchiveReport {
        pub archive: PathBuf,
        pub heading: String,
        /// Number of enclosing headings mirrored into the archive.
        pub ancestors: usize,
        /// Whether the outermost heading already had a branch in the archive.
        pub reused_branch: bool,
    }

    pub fn check_source(settings: &Settings, source: &Path) -> Result<(), ArchiveError> {
        if settings.recognizes(source) {
            Ok(())
        } else {
            Err(ArchiveError::UnrecognizedSource(source.to_path_buf()))
        }
    }

    /// Reject an archive target that is the source document under another name.
    ///
    /// Paths that do not exist yet cannot be the source, so they compare as given.
    pub fn check_target(target: &Path, source: &Path) -> Result<(), ArchiveError> {
        let resolve = |p: &Path| fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
        if resolve(target) == resolve(source) {
            Err(ArchiveError::ArchiveIsSource(target.to_path_buf()))
        } else {
            Ok(())
        }
    }

    /// Compute the merged archive text without touching either document.
    pub fn plan<D, S>(document: &D, store: &S) -> Result<(String, ArchiveReport)>
    where
        D: LiveDocument + ?Sized,
        S: ArchiveStore + ?Sized,
    {
        let subtree = document.current_subtree()?;
        let ancestors = document.ancestors()?;
        let heading = subtree.heading.clone();
        let path_tree = build_path(subtree, &ancestors);

        let archive_text = store.read()?;
        let archive = parse_outline(&archive_text)
            .with_context(|| format!("parsing archive {:?}", store.location()))?;
        let reused_branch = archive.position_of(&path_tree.heading).is_some();
        debug!(%heading, ancestors = ancestors.len(), reused_branch, "merging into archive");

        let merged = format_outline(&merge(archive, path_tree));
        let report = ArchiveReport {
            archive: store.location().to_path_buf(),
            heading,
            ancestors: ancestors.len(),
            reused_branch,
        };
        Ok((merged, report))
    }

    /// Archive the document's current heading into `store`.
    pub fn archive_subtree<D, S>(settings: &Settings, document: &mut D, store: &S) -> Result<ArchiveReport>
    where
        D: LiveDocument + FragmentRemover + ?Sized,
        S: ArchiveStore + ?Sized,
    {
        check_source(settings, document.location())?;
        check_target(store.location(), document.location())?;
        let (merged, report) = plan(&*document, store)?;
        store.write(&merged)?;
        document.remove_current().with_context(|| {
            format!(
                "{:?} was archived to {:?} but could not be removed from {:?}",
                report.heading,
                report.archive,
                document.location()
            )
        })?;
        info!(heading = %report.heading, archive = ?report.archive, "archived subtree");
        Ok(report)
    }

    /// Archive into the file named by `settings`.
    pub fn archive_to_file<D>(settings: &Settings, document: &mut D) -> Result<ArchiveReport>
    where
        D: LiveDocument + FragmentRemover + ?Sized,
    {
        let target = settings.archive_target(document.location())?;
        archive_subtree(settings, document, &FileArchive::new(target))
    }

}

pub use archive::{ArchiveReport, FileArchive, archive_subtree, archive_to_file};
pub use crate::core::{Ancestor, ArchiveError, Node};
pub use format::format_outline;
pub use merge::merge;
pub use parser::{NomOutlineParser, parse_outline};
pub use path::{build_path, treeify};
