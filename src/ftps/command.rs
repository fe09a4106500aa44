//! FTP command parsing
//!
//! A command line is `VERB [argument]\r\n`. Verbs are case-insensitive;
//! the argument is everything after the first space.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Auth(String),
    Pbsz(String),
    Prot(String),
    Syst,
    Feat,
    Opts(String),
    Noop,
    Type(String),
    Mode(String),
    Stru(String),
    Pwd,
    Cwd(String),
    Cdup,
    Pasv,
    Epsv,
    List(Option<String>),
    Nlst(Option<String>),
    Retr(String),
    Stor(String),
    Appe(String),
    Dele(String),
    Mkd(String),
    Rmd(String),
    Rnfr(String),
    Rnto(String),
    Size(String),
    Mdtm(String),
    Quit,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingArgument(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty command"),
            Self::MissingArgument(verb) => write!(f, "{verb} requires an argument"),
        }
    }
}

impl Command {
    /// Parse one control-channel line.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for blank lines or when a verb that needs
    /// an argument has none.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, Some(arg.trim())),
            None => (line, None),
        };
        if verb.is_empty() {
            return Err(ParseError::Empty);
        }
        let verb = verb.to_ascii_uppercase();
        let arg = arg.filter(|a| !a.is_empty());

        let required = |name: &'static str| {
            arg.map(str::to_string)
                .ok_or(ParseError::MissingArgument(name))
        };

        Ok(match verb.as_str() {
            "USER" => Self::User(required("USER")?),
            // An empty password is legal.
            "PASS" => Self::Pass(arg.unwrap_or_default().to_string()),
            "AUTH" => Self::Auth(required("AUTH")?),
            "PBSZ" => Self::Pbsz(required("PBSZ")?),
            "PROT" => Self::Prot(required("PROT")?),
            "SYST" => Self::Syst,
            "FEAT" => Self::Feat,
            "OPTS" => Self::Opts(required("OPTS")?),
            "NOOP" => Self::Noop,
            "TYPE" => Self::Type(required("TYPE")?),
            "MODE" => Self::Mode(required("MODE")?),
            "STRU" => Self::Stru(required("STRU")?),
            "PWD" | "XPWD" => Self::Pwd,
            "CWD" | "XCWD" => Self::Cwd(required("CWD")?),
            "CDUP" | "XCUP" => Self::Cdup,
            "PASV" => Self::Pasv,
            "EPSV" => Self::Epsv,
            "LIST" => Self::List(listing_path(arg)),
            "NLST" => Self::Nlst(listing_path(arg)),
            "RETR" => Self::Retr(required("RETR")?),
            "STOR" => Self::Stor(required("STOR")?),
            "APPE" => Self::Appe(required("APPE")?),
            "DELE" => Self::Dele(required("DELE")?),
            "MKD" | "XMKD" => Self::Mkd(required("MKD")?),
            "RMD" | "XRMD" => Self::Rmd(required("RMD")?),
            "RNFR" => Self::Rnfr(required("RNFR")?),
            "RNTO" => Self::Rnto(required("RNTO")?),
            "SIZE" => Self::Size(required("SIZE")?),
            "MDTM" => Self::Mdtm(required("MDTM")?),
            "QUIT" => Self::Quit,
            _ => Self::Unknown(verb),
        })
    }

    /// Whether the command is only accepted after a successful login.
    #[must_use]
    pub const fn requires_login(&self) -> bool {
        !matches!(
            self,
            Self::User(_)
                | Self::Pass(_)
                | Self::Auth(_)
                | Self::Pbsz(_)
                | Self::Prot(_)
                | Self::Syst
                | Self::Feat
                | Self::Opts(_)
                | Self::Noop
                | Self::Quit
                | Self::Unknown(_)
        )
    }

    /// Whether the command modifies the filesystem.
    #[must_use]
    pub const fn requires_write(&self) -> bool {
        matches!(
            self,
            Self::Stor(_)
                | Self::Appe(_)
                | Self::Dele(_)
                | Self::Mkd(_)
                | Self::Rmd(_)
                | Self::Rnfr(_)
                | Self::Rnto(_)
        )
    }
}

/// `LIST -la dir` is common; option words are dropped.
fn listing_path(arg: Option<&str>) -> Option<String> {
    let arg = arg?;
    let path = arg
        .split_whitespace()
        .skip_while(|word| word.starts_with('-'))
        .collect::<Vec<_>>()
        .join(" ");
    (!path.is_empty()).then_some(path)
}
