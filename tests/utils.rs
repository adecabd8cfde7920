use std::error::Error;

use bitcalm::cmd_execute::*;
use bitcalm::database::parse_dump_name;

#[test]
fn test_execute() -> Result<(), Box<dyn Error>> {
    let result = Cmd::new("echo").arg("-n").arg("teststring").execute()?;
    assert_eq!(result, "teststring");
    Ok(())
}

#[test]
fn test_execute_by_line() -> Result<(), Box<dyn Error>> {
    let result = Cmd::new("printf").arg("teststring\ntest\n").execute_by_line()?;
    assert_eq!(result, vec!["teststring", "test"]);
    Ok(())
}

#[test]
fn test_execute_keeps_spaces_in_args() -> Result<(), Box<dyn Error>> {
    let result = Cmd::new("echo").arg("-n").arg("two words").execute()?;
    assert_eq!(result, "two words");
    Ok(())
}

#[test]
fn test_execute_failure() {
    assert!(Cmd::new("false").execute().is_err());
}

#[test]
fn test_parse_dump_name() {
    assert_eq!(
        parse_dump_name("localhost_3306_shop_2021.06.01_0230.sql.gz"),
        Some(("localhost".to_string(), 3306, "shop".to_string()))
    );
    assert_eq!(parse_dump_name("garbage"), None);
    assert_eq!(parse_dump_name("host_notaport_db"), None);
}
