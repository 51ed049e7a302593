use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    combinator::{all_consuming, map, rest},
    sequence::preceded,
    IResult,
};

#[derive(Debug, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown,
}

/// Parses a client command line. Anything we don't recognize is `Unknown`
/// and gets relayed to the upstream untouched.
pub fn parse_command(input: &str) -> SmtpCommand {
    let parse_result: IResult<&str, SmtpCommand> = alt((
        map(preceded(tag_no_case("EHLO "), rest), |d: &str| {
            SmtpCommand::Ehlo(d.trim().to_string())
        }),
        map(preceded(tag_no_case("HELO "), rest), |d: &str| {
            SmtpCommand::Helo(d.trim().to_string())
        }),
        map(preceded(tag_no_case("MAIL FROM:"), rest), |a: &str| {
            SmtpCommand::MailFrom(a.trim().to_string())
        }),
        map(preceded(tag_no_case("RCPT TO:"), rest), |a: &str| {
            SmtpCommand::RcptTo(a.trim().to_string())
        }),
        map(all_consuming(tag_no_case("DATA")), |_| SmtpCommand::Data),
        map(all_consuming(tag_no_case("RSET")), |_| SmtpCommand::Rset),
        map(all_consuming(tag_no_case("NOOP")), |_| SmtpCommand::Noop),
        map(all_consuming(tag_no_case("QUIT")), |_| SmtpCommand::Quit),
    ))(input);

    match parse_result {
        Ok((_, command)) => command,
        Err(_) => SmtpCommand::Unknown,
    }
}
