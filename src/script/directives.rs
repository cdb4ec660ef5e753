/// Keyword of the directive that adds files or directories to the classpath.
pub const ADD_TO_CLASSPATH: &str = "add-to-classpath";
/// Keyword of the directive that declares a host module dependency.
pub const DEPENDS_ON_PLUGIN: &str = "depends-on-plugin";

/// Returns the argument of every line that starts with `prefix`, in file
/// order. Leading whitespace on a line is ignored.
pub fn find<'a>(lines: impl IntoIterator<Item = &'a str>, prefix: &str) -> Vec<String> {
    lines
        .into_iter()
        .filter_map(|line| line.trim_start().strip_prefix(prefix))
        .map(|rest| rest.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSPATH: &str = "// add-to-classpath ";

    #[test]
    fn extracts_arguments_in_file_order() {
        let source = "\
// add-to-classpath $HOME/lib/a.rlib
use crate::Binding;
  // add-to-classpath   /opt/b.so
fn main() {}
// add-to-classpath /opt/c";
        assert_eq!(
            find(source.lines(), CLASSPATH),
            vec!["$HOME/lib/a.rlib", "/opt/b.so", "/opt/c"]
        );
    }

    #[test]
    fn ignores_other_directives_and_comments() {
        let source = "// depends-on-plugin foo\n// add-to-classpathless\n/* add-to-classpath x */";
        assert!(find(source.lines(), CLASSPATH).is_empty());
        assert_eq!(find(source.lines(), "// depends-on-plugin "), vec!["foo"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(find("".lines(), CLASSPATH).is_empty());
    }
}
