//! Fixed source units the binary can run.

/// Prints its first argument.
pub const ECHO: &str = r#"namespace demo {
    type Program {
        static fn main(args: [str]) {
            io::print_line(args[0]);
        }
    }
}
"#;

/// Builds a filter over the arguments that is never enumerated, then prints
/// the first argument and a dynamically typed number.
pub const FILTERED_ECHO: &str = r#"use seq;

namespace demo {
    type Program {
        static fn main(args: [str]) {
            seq::filter(args, |a| !text::is_empty(a));
            io::print_line(args[0]);
            let number: dyn = 1;
            io::print_line(number);
        }
    }
}
"#;

/// Runs through an instance entry point.
pub const GREETER: &str = r#"namespace demo {
    type Greeter {
        field greeting: str = "hello";

        fn main(args: [str]) {
            io::print_line(self.greeting + " " + args[0]);
        }
    }
}
"#;

/// One closing brace short.
pub const UNBALANCED: &str = r#"namespace demo {
    type Program {
        static fn main(args: [str]) {
            io::print_line(args[0]);
        }
}
"#;
